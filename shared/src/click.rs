//! One button, two actions: a single click arms the webhook, a double click
//! sends the custom message instead.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{Clock, KeyNamespace, KeyValueStore, TypedKv};
use crate::config::{ClickThresholds, ConfigStore};
use crate::gate::NotificationGate;
use crate::model::{StepStatus, TargetId};
use crate::status::StatusBoard;
use crate::webhook::WebhookExecutor;

/// Persisted marker for an unresolved click round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickSession {
    pub message_index: usize,
    pub webhook_id: Option<i64>,
    pub started_at_ms: u64,
}

fn session_key(message_index: usize, webhook_id: Option<i64>) -> String {
    match webhook_id {
        Some(id) => format!("round-m{message_index}-w{id}"),
        None => format!("round-m{message_index}"),
    }
}

/// Resets affordances left mid-round by a previous process. Returns how many rounds were cleared.
pub async fn recover_sessions(store: Arc<dyn KeyValueStore>, board: &StatusBoard) -> usize {
    let sessions: TypedKv<ClickSession> = TypedKv::new(store, KeyNamespace::Session);
    let keys = match sessions.keys().await {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "failed to list click sessions");
            return 0;
        }
    };

    let mut cleared = 0;
    for key in keys {
        match sessions.get(&key).await {
            Ok(Some(session)) => {
                info!(key, "resetting affordances left mid-click");
                board.set(TargetId::Message(session.message_index), StepStatus::Idle).await;
                if let Some(id) = session.webhook_id {
                    board.set(TargetId::Webhook(id), StepStatus::Idle).await;
                }
                cleared += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(key, error = %e, "dropping unreadable click session"),
        }
        if let Err(e) = sessions.delete(&key).await {
            warn!(key, error = %e, "failed to delete click session");
        }
    }
    cleared
}

struct PendingRound {
    id: u64,
    started: Instant,
    token: CancellationToken,
}

enum ClickStep {
    Start { round_id: u64, token: CancellationToken },
    Double,
    Ignore,
}

struct CoordinatorInner {
    message_index: usize,
    webhook_id: Option<i64>,
    board: StatusBoard,
    webhooks: Arc<WebhookExecutor>,
    gate: Arc<NotificationGate>,
    config: ConfigStore,
    sessions: TypedKv<ClickSession>,
    clock: Arc<dyn Clock>,
    thresholds: ClickThresholds,
    pending: Mutex<Option<PendingRound>>,
    next_round: Mutex<u64>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

/// Click entry point bound to one custom-message slot and one webhook.
#[derive(Clone)]
pub struct UnifiedClickCoordinator {
    inner: Arc<CoordinatorInner>,
}

/// Everything one click needs, captured when the click happens.
#[derive(Clone, Debug, PartialEq)]
pub struct ClickInput {
    pub current: StepStatus,
    pub message_text: String,
    pub webhook_enabled: bool,
    pub webhook_url: String,
}

impl ClickInput {
    fn webhook_available(&self) -> bool {
        self.webhook_enabled && !self.webhook_url.trim().is_empty()
    }
}

impl UnifiedClickCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_index: usize,
        webhook_id: Option<i64>,
        board: StatusBoard,
        webhooks: Arc<WebhookExecutor>,
        gate: Arc<NotificationGate>,
        config: ConfigStore,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        thresholds: ClickThresholds,
        tasks: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                message_index,
                webhook_id,
                board,
                webhooks,
                gate,
                config,
                sessions: TypedKv::new(store, KeyNamespace::Session),
                clock,
                thresholds,
                pending: Mutex::new(None),
                next_round: Mutex::new(0),
                tasks,
                cancel,
            }),
        }
    }

    fn message_target(&self) -> TargetId {
        TargetId::Message(self.inner.message_index)
    }

    fn webhook_target(&self) -> Option<TargetId> {
        self.inner.webhook_id.map(TargetId::Webhook)
    }

    fn pending(&self) -> MutexGuard<'_, Option<PendingRound>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_pending(&self) -> bool {
        self.pending().is_some()
    }

    /// Combined status of the two bound affordances as the user sees it.
    pub fn current_status(&self) -> StepStatus {
        let board = &self.inner.board;
        let message = board.status(self.message_target());
        let webhook = self.webhook_target().map(|t| board.status(t));
        let both = [Some(message), webhook];
        for wanted in [StepStatus::Executing, StepStatus::Success, StepStatus::Error] {
            if both.contains(&Some(wanted)) {
                return wanted;
            }
        }
        message
    }

    /// Reads the click inputs from the live configuration.
    pub fn snapshot_input(&self) -> ClickInput {
        let snapshot = self.inner.config.snapshot();
        let message_text = snapshot
            .notification()
            .and_then(|n| n.custom_message(self.inner.message_index))
            .unwrap_or_default()
            .to_string();
        let (webhook_enabled, webhook_url) = self
            .inner
            .webhook_id
            .and_then(|id| snapshot.webhook_by_id(id))
            .map(|w| (w.enabled, w.url.clone()))
            .unwrap_or_default();
        ClickInput {
            current: self.current_status(),
            message_text,
            webhook_enabled,
            webhook_url,
        }
    }

    /// Click using the current status and configuration.
    pub async fn click(&self) {
        let input = self.snapshot_input();
        self.on_click(input).await;
    }

    #[instrument(skip(self), fields(message = self.inner.message_index, webhook = ?self.inner.webhook_id))]
    pub async fn on_click(&self, input: ClickInput) {
        match input.current {
            StepStatus::Executing => {
                debug!("click ignored while executing");
                return;
            }
            StepStatus::Success | StepStatus::Error => {
                self.end_round(None);
                self.reset_both().await;
                return;
            }
            _ => {}
        }

        let now = Instant::now();
        let window = self.inner.thresholds.action_threshold();
        let has_text = !input.message_text.trim().is_empty();
        // Checking for a round and claiming one happen under the same guard.
        let step = {
            let mut pending = self.pending();
            match pending.as_ref().map(|round| now.duration_since(round.started) < window) {
                None => {
                    let round = self.new_round(now);
                    let step = ClickStep::Start {
                        round_id: round.id,
                        token: round.token.clone(),
                    };
                    *pending = Some(round);
                    step
                }
                Some(true) if has_text => {
                    if let Some(round) = pending.take() {
                        round.token.cancel();
                    }
                    ClickStep::Double
                }
                Some(_) => ClickStep::Ignore,
            }
        };

        match step {
            ClickStep::Start { round_id, token } => self.start_round(round_id, token, input).await,
            ClickStep::Double => {
                info!("double click, sending custom message");
                self.send_custom_message(input.message_text).await;
            }
            ClickStep::Ignore => debug!("second click ignored"),
        }
    }

    fn new_round(&self, now: Instant) -> PendingRound {
        let mut next = self
            .inner
            .next_round
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *next += 1;
        PendingRound {
            id: *next,
            started: now,
            token: self.inner.cancel.child_token(),
        }
    }

    async fn start_round(&self, round_id: u64, token: CancellationToken, input: ClickInput) {
        let cancel_after = self.inner.thresholds.cancel_threshold();
        let board = &self.inner.board;
        board
            .hold(self.message_target(), StepStatus::First, cancel_after, StepStatus::Idle)
            .await;
        if let Some(target) = self.webhook_target() {
            board.hold(target, StepStatus::First, cancel_after, StepStatus::Idle).await;
        }

        let session = ClickSession {
            message_index: self.inner.message_index,
            webhook_id: self.inner.webhook_id,
            started_at_ms: self.inner.clock.now_ms(),
        };
        if let Err(e) = self.inner.sessions.set(&self.session_key(), &session).await {
            warn!(error = %e, "failed to persist click session");
        }

        let action = self.clone();
        let action_token = token.clone();
        let webhook_available = input.webhook_available();
        self.inner.tasks.spawn(async move {
            tokio::select! {
                biased;
                () = action_token.cancelled() => {}
                () = tokio::time::sleep(action.inner.thresholds.action_threshold()) => {
                    action.on_action_timer(round_id, webhook_available).await;
                }
            }
        });

        let watchdog = self.clone();
        self.inner.tasks.spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(cancel_after) => watchdog.on_cancel_timer(round_id).await,
            }
        });
    }

    fn session_key(&self) -> String {
        session_key(self.inner.message_index, self.inner.webhook_id)
    }

    fn is_current_round(&self, round_id: u64) -> bool {
        self.pending().as_ref().is_some_and(|r| r.id == round_id)
    }

    /// Clears the pending round (only `round_id` when given) and stops its timers.
    fn end_round(&self, round_id: Option<u64>) -> bool {
        let mut pending = self.pending();
        let matches = match (pending.as_ref(), round_id) {
            (Some(round), Some(id)) => round.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            if let Some(round) = pending.take() {
                round.token.cancel();
            }
        }
        matches
    }

    async fn clear_session(&self) {
        if let Err(e) = self.inner.sessions.delete(&self.session_key()).await {
            warn!(error = %e, "failed to clear click session");
        }
    }

    async fn reset_both(&self) {
        self.inner.board.set(self.message_target(), StepStatus::Idle).await;
        if let Some(target) = self.webhook_target() {
            self.inner.board.set(target, StepStatus::Idle).await;
        }
        self.clear_session().await;
    }

    async fn on_action_timer(&self, round_id: u64, webhook_available: bool) {
        if !self.is_current_round(round_id) {
            return;
        }
        if !webhook_available || self.webhook_target().is_none() {
            info!("no webhook available, resetting");
            self.end_round(Some(round_id));
            self.reset_both().await;
            return;
        }

        info!("single click, executing webhook");
        self.inner.board.set(self.message_target(), StepStatus::Idle).await;
        let sent = self
            .inner
            .webhooks
            .execute_webhook_with_state_transitions(self.inner.webhook_id)
            .await;
        debug!(sent, "webhook path finished");
        // The watchdog may have already reset a stuck round.
        if self.end_round(Some(round_id)) {
            self.clear_session().await;
        }
    }

    async fn on_cancel_timer(&self, round_id: u64) {
        if !self.is_current_round(round_id) {
            return;
        }
        warn!(round_id, "click round still pending at hard timeout, cancelling");
        // Drop the pending round without cancelling its token: the webhook
        // path may be running inside the action timer task.
        self.pending().take();
        self.inner.board.cancel(self.message_target()).await;
        if let Some(target) = self.webhook_target() {
            self.inner.board.cancel(target).await;
        }
        self.clear_session().await;
    }

    async fn send_custom_message(&self, text: String) {
        self.clear_session().await;
        if let Some(target) = self.webhook_target() {
            self.inner.board.set(target, StepStatus::Idle).await;
        }
        let delivered = self
            .inner
            .board
            .run_action(self.message_target(), self.inner.gate.deliver_text(&text))
            .await;
        debug!(delivered, "custom message path finished");
    }

    /// Stops both timers of a pending round and waits for in-flight actions.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}
