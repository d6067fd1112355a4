//! The handle a host shell holds: every consumed capability is injected here
//! and every exposed entry point hangs off it.

use futures::Stream;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, instrument, warn};

use crate::capabilities::{Clock, HttpClient, KeyValueStore, LocationSource};
use crate::click::{recover_sessions, UnifiedClickCoordinator};
use crate::config::{ConfigStore, EngineConfig};
use crate::dispatch::ProviderDispatcher;
use crate::gate::NotificationGate;
use crate::model::{RideEvent, RideState, StepStatus, TargetId};
use crate::status::StatusBoard;
use crate::surface::ActionSurface;
use crate::tracker::{RideEventSink, RideStateTracker};
use crate::webhook::WebhookExecutor;
use crate::Error;

/// What `Engine::recover` restored at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Recovered {
    pub transitions: usize,
    pub click_sessions: usize,
}

pub struct Engine {
    settings: EngineConfig,
    config: ConfigStore,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    board: StatusBoard,
    gate: Arc<NotificationGate>,
    webhooks: Arc<WebhookExecutor>,
    sink: RideEventSink,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        settings: EngineConfig,
        http: Arc<dyn HttpClient>,
        store: Arc<dyn KeyValueStore>,
        location: Arc<dyn LocationSource>,
        clock: Arc<dyn Clock>,
        config: ConfigStore,
    ) -> Result<Self, Error> {
        settings.validate()?;

        let cancel = CancellationToken::new();
        let board = StatusBoard::new(
            Arc::clone(&store),
            config.clone(),
            Arc::clone(&clock),
            settings.timings.clone(),
            cancel.child_token(),
        );
        let dispatcher = Arc::new(ProviderDispatcher::new(
            Arc::clone(&http),
            &settings,
            cancel.child_token(),
        ));
        let gate = Arc::new(NotificationGate::new(
            dispatcher,
            config.clone(),
            Arc::clone(&clock),
            &settings,
        ));
        let webhooks = Arc::new(WebhookExecutor::new(
            http,
            config.clone(),
            location,
            board.clone(),
            &settings,
        ));
        let tasks = TaskTracker::new();
        let sink = RideEventSink::new(
            Arc::clone(&gate),
            Arc::clone(&webhooks),
            config.clone(),
            tasks.clone(),
        );

        Ok(Self {
            settings,
            config,
            store,
            clock,
            board,
            gate,
            webhooks,
            sink,
            tasks,
            cancel,
        })
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    pub fn gate(&self) -> &Arc<NotificationGate> {
        &self.gate
    }

    /// Restores journaled status transitions and resets abandoned click rounds.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Recovered, Error> {
        let transitions = self.board.recover().await?;
        let click_sessions = recover_sessions(Arc::clone(&self.store), &self.board).await;
        let recovered = Recovered {
            transitions,
            click_sessions,
        };
        info!(?recovered, "startup recovery finished");
        Ok(recovered)
    }

    /// Mutates and persists the status of one affordance.
    pub async fn update_status(&self, target: TargetId, status: StepStatus) {
        self.board.set(target, status).await;
    }

    pub async fn trigger_webhook(&self, webhook_id: i64) -> bool {
        self.webhooks.trigger_webhook(webhook_id).await
    }

    pub async fn execute_webhook_with_state_transitions(&self, webhook_id: Option<i64>) -> bool {
        self.webhooks
            .execute_webhook_with_state_transitions(webhook_id)
            .await
    }

    /// Sends custom message `index` while driving its status through EXECUTING.
    #[instrument(skip(self))]
    pub async fn execute_message_with_state_transitions(&self, index: usize) -> bool {
        let snapshot = self.config.snapshot();
        let Some(text) = snapshot.notification().and_then(|n| n.custom_message(index)) else {
            warn!("custom message is empty, nothing to send");
            return false;
        };
        self.board
            .run_action(TargetId::Message(index), self.gate.deliver_text(text))
            .await
    }

    /// Fans a single ride event out to notifications and webhooks without a tracker.
    pub fn dispatch_ride_event(&self, event: RideEvent) -> usize {
        self.sink.fan_out(event)
    }

    /// Starts observing a ride-state stream. Stops on stream end or `shutdown`.
    pub fn spawn_ride_tracker<S>(&self, states: S) -> JoinHandle<()>
    where
        S: Stream<Item = RideState> + Send + 'static,
    {
        let tracker = RideStateTracker::new();
        let sink = self.sink.clone();
        let cancel = self.cancel.child_token();
        self.tasks.spawn(tracker.run(states, sink, cancel))
    }

    pub fn surface(&self, target: TargetId) -> ActionSurface {
        ActionSurface::new(
            target,
            self.board.clone(),
            self.config.clone(),
            Arc::clone(&self.webhooks),
            Arc::clone(&self.gate),
            self.cancel.child_token(),
        )
    }

    pub fn click_coordinator(&self, message_index: usize, webhook_id: Option<i64>) -> UnifiedClickCoordinator {
        UnifiedClickCoordinator::new(
            message_index,
            webhook_id,
            self.board.clone(),
            Arc::clone(&self.webhooks),
            Arc::clone(&self.gate),
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.settings.click.clone(),
            TaskTracker::new(),
            self.cancel.child_token(),
        )
    }

    /// Cancels everything the engine started and waits for its own tasks.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.board.shutdown().await;
    }
}
