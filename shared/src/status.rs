//! Shared affordance lifecycle: pure transitions, the live status board, and the
//! crash-recovery journal behind it.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{Clock, KeyNamespace, KeyValueStore, KvError, TypedKv};
use crate::config::{ConfigStore, StatusTimings};
use crate::keyed::KeyedMutex;
use crate::model::{StepStatus, TargetId};

// ============================================================================
// Pure transitions
// ============================================================================

pub struct StatusStateMachine;

impl StatusStateMachine {
    /// Next state for a user click, or `None` when the click is ignored.
    pub fn on_click(current: StepStatus) -> Option<StepStatus> {
        match current {
            StepStatus::Idle => Some(StepStatus::First),
            StepStatus::First => Some(StepStatus::Executing),
            StepStatus::Success | StepStatus::Error | StepStatus::Cancel => Some(StepStatus::Idle),
            StepStatus::Executing | StepStatus::NotAvailable => None,
        }
    }

    /// Only an executing action can complete.
    pub fn on_completion(current: StepStatus, success: bool) -> Option<StepStatus> {
        match (current, success) {
            (StepStatus::Executing, true) => Some(StepStatus::Success),
            (StepStatus::Executing, false) => Some(StepStatus::Error),
            _ => None,
        }
    }

    /// Delay after which `status` reverts to IDLE on its own.
    pub fn auto_reset(status: StepStatus, timings: &StatusTimings) -> Option<Duration> {
        match status {
            StepStatus::First => Some(timings.first_revert()),
            StepStatus::Success => Some(timings.success_dwell()),
            StepStatus::Error => Some(timings.error_dwell()),
            _ => None,
        }
    }

    /// Where an interrupted timed state lands after a restart.
    pub fn recovery_target(status: StepStatus) -> StepStatus {
        match status {
            StepStatus::Executing => StepStatus::Success,
            _ => StepStatus::Idle,
        }
    }
}

// ============================================================================
// Journal
// ============================================================================

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal storage error: {0}")]
    Storage(#[from] KvError),
}

/// Persisted in-flight status with the wall-clock time its timer fires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub status: StepStatus,
    pub deadline_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<StepStatus>,
}

impl TransitionRecord {
    pub fn next_status(&self) -> StepStatus {
        self.next
            .unwrap_or_else(|| StatusStateMachine::recovery_target(self.status))
    }
}

#[derive(Clone)]
pub struct TransitionJournal {
    records: TypedKv<TransitionRecord>,
}

impl TransitionJournal {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            records: TypedKv::new(store, KeyNamespace::Transition),
        }
    }

    pub async fn write(&self, target: TargetId, record: &TransitionRecord) -> Result<(), JournalError> {
        Ok(self.records.set(&target.storage_key(), record).await?)
    }

    pub async fn clear(&self, target: TargetId) -> Result<(), JournalError> {
        self.records.delete(&target.storage_key()).await?;
        Ok(())
    }

    pub async fn read(&self, target: TargetId) -> Result<Option<TransitionRecord>, JournalError> {
        Ok(self.records.get(&target.storage_key()).await?)
    }

    async fn keys(&self) -> Result<Vec<String>, JournalError> {
        Ok(self.records.keys().await?)
    }

    async fn read_key(&self, key: &str) -> Result<Option<TransitionRecord>, JournalError> {
        Ok(self.records.get(key).await?)
    }

    async fn remove_key(&self, key: &str) -> Result<(), JournalError> {
        self.records.delete(key).await?;
        Ok(())
    }
}

// ============================================================================
// Board
// ============================================================================

struct PendingTimer {
    expected: StepStatus,
    token: CancellationToken,
}

struct BoardInner {
    channels: Mutex<HashMap<TargetId, watch::Sender<StepStatus>>>,
    timers: Mutex<HashMap<TargetId, PendingTimer>>,
    locks: KeyedMutex<TargetId>,
    journal: TransitionJournal,
    config: ConfigStore,
    clock: Arc<dyn Clock>,
    timings: StatusTimings,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Live status of every affordance. Status writes serialize per target.
#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<BoardInner>,
}

impl StatusBoard {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: ConfigStore,
        clock: Arc<dyn Clock>,
        timings: StatusTimings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(BoardInner {
                channels: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                locks: KeyedMutex::new(),
                journal: TransitionJournal::new(store),
                config,
                clock,
                timings,
                tracker: TaskTracker::new(),
                cancel,
            }),
        }
    }

    pub fn timings(&self) -> &StatusTimings {
        &self.inner.timings
    }

    pub fn journal(&self) -> &TransitionJournal {
        &self.inner.journal
    }

    pub fn status(&self, target: TargetId) -> StepStatus {
        relock(&self.inner.channels)
            .get(&target)
            .map_or(StepStatus::Idle, |tx| *tx.borrow())
    }

    pub fn subscribe(&self, target: TargetId) -> watch::Receiver<StepStatus> {
        relock(&self.inner.channels)
            .entry(target)
            .or_insert_with(|| watch::channel(StepStatus::Idle).0)
            .subscribe()
    }

    fn publish(&self, target: TargetId, status: StepStatus) {
        {
            let mut channels = relock(&self.inner.channels);
            match channels.get(&target) {
                Some(tx) => {
                    tx.send_replace(status);
                }
                None => {
                    channels.insert(target, watch::channel(status).0);
                }
            }
        }
        self.inner.config.mirror_status(target, status);
    }

    fn cancel_timer(&self, target: TargetId) {
        if let Some(timer) = relock(&self.inner.timers).remove(&target) {
            timer.token.cancel();
        }
    }

    fn arm(&self, target: TargetId, expected: StepStatus, after: Duration, next: StepStatus) {
        let token = self.inner.cancel.child_token();
        relock(&self.inner.timers).insert(
            target,
            PendingTimer {
                expected,
                token: token.clone(),
            },
        );

        let board = self.clone();
        self.inner.tracker.spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(after) => board.fire(target, expected, next, &token).await,
            }
        });
    }

    async fn fire(&self, target: TargetId, expected: StepStatus, next: StepStatus, token: &CancellationToken) {
        let _guard = self.inner.locks.lock(&target).await;
        if token.is_cancelled() || self.status(target) != expected {
            debug!(%target, %expected, "stale status timer dropped");
            return;
        }
        debug!(%target, from = %expected, to = %next, "status timer fired");
        self.apply_locked(target, next, None).await;
    }

    /// Publishes `status`, replacing any pending timer. `hold` overrides the
    /// status's own auto-reset with an explicit dwell and follow-up state.
    async fn apply_locked(
        &self,
        target: TargetId,
        status: StepStatus,
        hold: Option<(Duration, StepStatus)>,
    ) {
        let hold = hold.or_else(|| {
            StatusStateMachine::auto_reset(status, &self.inner.timings).map(|d| (d, StepStatus::Idle))
        });

        self.cancel_timer(target);
        self.publish(target, status);

        let now = self.inner.clock.now_ms();
        let record = match hold {
            Some((after, next)) => {
                self.arm(target, status, after, next);
                Some(TransitionRecord {
                    status,
                    deadline_ms: now.saturating_add(millis(after)),
                    next: Some(next),
                })
            }
            // An action interrupted by process death returns to IDLE.
            None if status == StepStatus::Executing => Some(TransitionRecord {
                status,
                deadline_ms: now,
                next: Some(StepStatus::Idle),
            }),
            None => None,
        };

        let result = match &record {
            Some(record) => self.inner.journal.write(target, record).await,
            None => self.inner.journal.clear(target).await,
        };
        if let Err(e) = result {
            warn!(%target, error = %e, "failed to journal status transition");
        }
    }

    /// Sets `status` directly, arming its auto-reset if it has one.
    #[instrument(skip(self))]
    pub async fn set(&self, target: TargetId, status: StepStatus) {
        let _guard = self.inner.locks.lock(&target).await;
        self.apply_locked(target, status, None).await;
    }

    /// Shows `status` for `dwell`, then moves to `next`.
    pub async fn hold(&self, target: TargetId, status: StepStatus, dwell: Duration, next: StepStatus) {
        let _guard = self.inner.locks.lock(&target).await;
        self.apply_locked(target, status, Some((dwell, next))).await;
    }

    /// Applies a click to one affordance. Returns the new status, or `None` if ignored.
    pub async fn click(&self, target: TargetId) -> Option<StepStatus> {
        let _guard = self.inner.locks.lock(&target).await;
        let next = StatusStateMachine::on_click(self.status(target))?;
        self.apply_locked(target, next, None).await;
        Some(next)
    }

    /// Completes an executing action. SUCCESS is shown only after the executing dwell.
    pub async fn complete(&self, target: TargetId, success: bool) -> bool {
        let _guard = self.inner.locks.lock(&target).await;
        let current = self.status(target);
        let Some(next) = StatusStateMachine::on_completion(current, success) else {
            warn!(%target, %current, "completion ignored outside EXECUTING");
            return false;
        };
        if success {
            let dwell = self.inner.timings.executing_dwell();
            self.apply_locked(target, current, Some((dwell, next))).await;
        } else {
            self.apply_locked(target, next, None).await;
        }
        true
    }

    /// Fails an EXECUTING action whose runner went away before completing.
    /// Does nothing once a completion has armed the executing dwell.
    pub async fn abandon(&self, target: TargetId) -> bool {
        let _guard = self.inner.locks.lock(&target).await;
        let completing = relock(&self.inner.timers).contains_key(&target);
        if self.status(target) != StepStatus::Executing || completing {
            return false;
        }
        warn!(%target, "action abandoned before completion");
        self.apply_locked(target, StepStatus::Error, None).await;
        true
    }

    /// External cancel signal: CANCEL, then straight back to IDLE.
    pub async fn cancel(&self, target: TargetId) {
        let _guard = self.inner.locks.lock(&target).await;
        self.apply_locked(target, StepStatus::Cancel, None).await;
        self.apply_locked(target, StepStatus::Idle, None).await;
    }

    /// Runs `action` under EXECUTING and drives the outcome through SUCCESS or ERROR.
    /// A panicking action counts as a failure.
    pub async fn run_action<F>(&self, target: TargetId, action: F) -> bool
    where
        F: Future<Output = bool>,
    {
        self.set(target, StepStatus::Executing).await;
        let success = AssertUnwindSafe(action)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(%target, "action panicked");
                false
            });
        self.complete(target, success).await;
        success
    }

    /// Resumes or finalizes journaled transitions. Returns how many were restored.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, JournalError> {
        let journal = &self.inner.journal;
        let now = self.inner.clock.now_ms();
        let mut restored = 0;

        for key in journal.keys().await? {
            let Some(target) = TargetId::from_storage_key(&key) else {
                warn!(key, "dropping journal record for unknown target");
                if let Err(e) = journal.remove_key(&key).await {
                    warn!(key, error = %e, "failed to drop journal record");
                }
                continue;
            };

            let record = match journal.read_key(&key).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%target, error = %e, "dropping unreadable journal record");
                    if let Err(e) = journal.remove_key(&key).await {
                        warn!(%target, error = %e, "failed to drop journal record");
                    }
                    continue;
                }
            };

            let next = record.next_status();
            let _guard = self.inner.locks.lock(&target).await;
            if record.deadline_ms <= now {
                info!(%target, from = %record.status, to = %next, "finalizing expired transition");
                self.apply_locked(target, next, None).await;
            } else {
                let remaining = Duration::from_millis(record.deadline_ms - now);
                info!(%target, status = %record.status, ?remaining, "resuming transition");
                self.cancel_timer(target);
                self.publish(target, record.status);
                self.arm(target, record.status, remaining, next);
            }
            restored += 1;
        }
        Ok(restored)
    }

    /// Cancels every pending timer and waits for timer tasks to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}
