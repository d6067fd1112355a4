//! A single on-screen affordance bound to one message slot or one webhook.
//!
//! Each surface owns its task group: the view-refresh loop and any action it
//! started stop together when the surface is shut down.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument};

use crate::config::{ConfigSnapshot, ConfigStore};
use crate::gate::NotificationGate;
use crate::model::{StepStatus, TargetId};
use crate::status::StatusBoard;
use crate::webhook::WebhookExecutor;

/// Whether `target` has something to act on in `snapshot`.
pub fn is_bound(snapshot: &ConfigSnapshot, target: TargetId) -> bool {
    match target {
        TargetId::Message(index) => snapshot
            .notification()
            .and_then(|n| n.custom_message(index))
            .is_some(),
        TargetId::Webhook(id) => snapshot.webhook_by_id(id).is_some(),
    }
}

fn view_of(snapshot: &ConfigSnapshot, target: TargetId, status: StepStatus) -> StepStatus {
    if is_bound(snapshot, target) {
        status
    } else {
        StepStatus::NotAvailable
    }
}

struct SurfaceInner {
    target: TargetId,
    board: StatusBoard,
    config: ConfigStore,
    webhooks: Arc<WebhookExecutor>,
    gate: Arc<NotificationGate>,
    view: watch::Receiver<StepStatus>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ActionSurface {
    inner: Arc<SurfaceInner>,
}

impl ActionSurface {
    /// Binds to `target` and starts the view loop. `cancel` should be a child of the engine token.
    pub fn new(
        target: TargetId,
        board: StatusBoard,
        config: ConfigStore,
        webhooks: Arc<WebhookExecutor>,
        gate: Arc<NotificationGate>,
        cancel: CancellationToken,
    ) -> Self {
        let mut status_rx = board.subscribe(target);
        let mut config_rx = config.subscribe();
        let initial = view_of(&config_rx.borrow_and_update(), target, *status_rx.borrow_and_update());
        let (view_tx, view) = watch::channel(initial);

        let tasks = TaskTracker::new();
        let loop_cancel = cancel.clone();
        tasks.spawn(async move {
            loop {
                let changed = tokio::select! {
                    biased;
                    () = loop_cancel.cancelled() => break,
                    r = status_rx.changed() => r,
                    r = config_rx.changed() => r,
                };
                if changed.is_err() {
                    break;
                }
                let status = *status_rx.borrow_and_update();
                let next = view_of(&config_rx.borrow_and_update(), target, status);
                view_tx.send_if_modified(|shown| {
                    if *shown == next {
                        return false;
                    }
                    *shown = next;
                    true
                });
            }
            debug!(%target, "view loop stopped");
        });

        Self {
            inner: Arc::new(SurfaceInner {
                target,
                board,
                config,
                webhooks,
                gate,
                view,
                tasks,
                cancel,
            }),
        }
    }

    pub fn target(&self) -> TargetId {
        self.inner.target
    }

    /// Status as the renderer should draw it.
    pub fn status(&self) -> StepStatus {
        *self.inner.view.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<StepStatus> {
        self.inner.view.clone()
    }

    /// Applies one click. Reaching EXECUTING starts the bound action in the background.
    #[instrument(skip(self), fields(target = %self.inner.target))]
    pub async fn click(&self) -> Option<StepStatus> {
        let target = self.inner.target;
        if !is_bound(&self.inner.config.snapshot(), target) {
            debug!("click on unbound surface ignored");
            return None;
        }
        let next = self.inner.board.click(target).await?;
        if next == StepStatus::Executing {
            info!("confirmed, running action");
            self.spawn_action();
        }
        Some(next)
    }

    fn spawn_action(&self) {
        let surface = self.clone();
        let cancel = self.inner.cancel.clone();
        self.inner.tasks.spawn(async move {
            let finished = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                ok = surface.run_action() => Some(ok),
            };
            match finished {
                Some(ok) => debug!(ok, "surface action finished"),
                None => {
                    debug!("surface closed before the action finished");
                    surface.inner.board.abandon(surface.inner.target).await;
                }
            }
        });
    }

    async fn run_action(&self) -> bool {
        let inner = &self.inner;
        match inner.target {
            TargetId::Webhook(id) => inner.webhooks.execute_webhook_with_state_transitions(Some(id)).await,
            TargetId::Message(index) => {
                let snapshot = inner.config.snapshot();
                let text = snapshot
                    .notification()
                    .and_then(|n| n.custom_message(index))
                    .unwrap_or_default()
                    .to_string();
                inner
                    .board
                    .run_action(inner.target, inner.gate.deliver_text(&text))
                    .await
            }
        }
    }

    /// Stops the view loop and any running action, then waits for them.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{Clock, KeyValueStore, MemoryKvStore};
    use crate::config::EngineConfig;
    use crate::dispatch::ProviderDispatcher;
    use crate::model::{Coordinates, NotificationConfig, Provider, SenderConfig, WebhookConfig};
    use crate::testing::{FixedLocation, ManualClock, RecordingHttp};
    use std::time::Duration;

    struct Fixture {
        board: StatusBoard,
        config: ConfigStore,
        http: Arc<RecordingHttp>,
        webhooks: Arc<WebhookExecutor>,
        gate: Arc<NotificationGate>,
    }

    impl Fixture {
        fn surface(&self, target: TargetId) -> ActionSurface {
            ActionSurface::new(
                target,
                self.board.clone(),
                self.config.clone(),
                Arc::clone(&self.webhooks),
                Arc::clone(&self.gate),
                CancellationToken::new(),
            )
        }
    }

    fn fixture(custom_text: &str) -> Fixture {
        fixture_with(RecordingHttp::replying(200, "{}"), custom_text)
    }

    fn fixture_with(http: Arc<RecordingHttp>, custom_text: &str) -> Fixture {
        let settings = EngineConfig::default();
        let mut notification = NotificationConfig {
            phone_numbers: vec!["15550002222".into()],
            ..NotificationConfig::default()
        };
        notification.custom_messages[1] = custom_text.to_string();
        let config = ConfigStore::new(ConfigSnapshot {
            notifications: vec![notification],
            senders: vec![SenderConfig::new(Provider::ChatApi, "token")],
            webhooks: vec![WebhookConfig {
                id: 3,
                url: "https://hooks.example.com/lights".into(),
                enabled: true,
                ..WebhookConfig::default()
            }],
        });
        let clock = ManualClock::at(0);
        let cancel = CancellationToken::new();
        let board = StatusBoard::new(
            Arc::new(MemoryKvStore::new()) as Arc<dyn KeyValueStore>,
            config.clone(),
            clock.clone() as Arc<dyn Clock>,
            settings.timings.clone(),
            cancel.clone(),
        );
        let dispatcher = Arc::new(ProviderDispatcher::new(
            http.clone(),
            &settings,
            cancel,
        ));
        let gate = Arc::new(NotificationGate::new(
            dispatcher,
            config.clone(),
            clock as Arc<dyn Clock>,
            &settings,
        ));
        let webhooks = Arc::new(WebhookExecutor::new(
            http.clone(),
            config.clone(),
            Arc::new(FixedLocation(Ok(Coordinates::default()))),
            board.clone(),
            &settings,
        ));
        Fixture {
            board,
            config,
            http,
            webhooks,
            gate,
        }
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[test]
    fn test_binding_rules() {
        let mut snapshot = ConfigSnapshot {
            notifications: vec![NotificationConfig::default()],
            webhooks: vec![WebhookConfig {
                id: 9,
                ..WebhookConfig::default()
            }],
            ..ConfigSnapshot::default()
        };
        assert!(is_bound(&snapshot, TargetId::Webhook(9)));
        assert!(!is_bound(&snapshot, TargetId::Webhook(10)));
        assert!(!is_bound(&snapshot, TargetId::Message(0)));

        snapshot.notifications[0].custom_messages[0] = "Running late".into();
        assert!(is_bound(&snapshot, TargetId::Message(0)));
        assert!(!is_bound(&snapshot, TargetId::Message(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_message_is_not_available() {
        let f = fixture("   ");
        let surface = f.surface(TargetId::Message(1));
        assert_eq!(surface.status(), StepStatus::NotAvailable);
        assert_eq!(surface.click().await, None);
        assert_eq!(f.board.status(TargetId::Message(1)), StepStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_follows_config_changes() {
        let f = fixture("");
        let surface = f.surface(TargetId::Message(1));
        let mut view = surface.watch();
        assert_eq!(*view.borrow_and_update(), StepStatus::NotAvailable);

        let mut notification = f.config.snapshot().notifications[0].clone();
        notification.custom_messages[1] = "Flat tyre, be back soon".into();
        f.config.set_notifications(vec![notification]);

        tokio::time::timeout(Duration::from_secs(1), view.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*view.borrow(), StepStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_webhook_surface_two_click_flow() {
        let f = fixture("");
        let surface = f.surface(TargetId::Webhook(3));

        assert_eq!(surface.click().await, Some(StepStatus::First));
        assert_eq!(surface.click().await, Some(StepStatus::Executing));
        advance(100).await;
        assert_eq!(f.http.count(), 1);
        assert_eq!(surface.status(), StepStatus::Executing);

        advance(10_000).await;
        assert_eq!(surface.status(), StepStatus::Success);
        advance(5_000).await;
        assert_eq!(surface.status(), StepStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_surface_sends_custom_text() {
        let f = fixture("Meet at the cafe");
        let surface = f.surface(TargetId::Message(1));
        surface.click().await;
        surface.click().await;
        advance(100).await;

        let sent = f.http.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].json()["body"], "Meet at the cafe");
        assert_eq!(
            f.config.snapshot().notifications[0].message_statuses[1],
            StepStatus::Executing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_click_reverts() {
        let f = fixture("");
        let surface = f.surface(TargetId::Webhook(3));
        surface.click().await;
        advance(10_100).await;
        assert_eq!(surface.status(), StepStatus::Idle);
        assert_eq!(f.http.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_action_releases_target() {
        let f = fixture_with(RecordingHttp::slow(Duration::from_secs(5), 200), "");
        let target = TargetId::Webhook(3);
        let surface = f.surface(target);
        surface.click().await;
        surface.click().await;
        advance(100).await;
        assert_eq!(f.http.count(), 1);

        surface.shutdown().await;
        assert_eq!(f.board.status(target), StepStatus::Error);

        advance(10_100).await;
        assert_eq!(f.board.status(target), StepStatus::Idle);
        assert_eq!(f.board.click(target).await, Some(StepStatus::First));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_view_loop() {
        let f = fixture("");
        let surface = f.surface(TargetId::Webhook(3));
        surface.shutdown().await;

        f.board.set(TargetId::Webhook(3), StepStatus::Error).await;
        advance(100).await;
        assert_eq!(surface.status(), StepStatus::Idle);
    }
}
