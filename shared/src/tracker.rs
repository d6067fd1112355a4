//! Ride-state observation: dedups repeats, classifies transitions, and fans
//! each event out to notifications and webhooks.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument};

use crate::config::ConfigStore;
use crate::gate::NotificationGate;
use crate::model::{RideEvent, RideState};
use crate::webhook::WebhookExecutor;

/// Boot-scoped classifier. "start" fires only for the first recording since construction.
#[derive(Debug, Clone)]
pub struct RideStateTracker {
    last: Option<RideState>,
    was_recording: bool,
    was_paused: bool,
    first_recording_since_boot: bool,
}

impl Default for RideStateTracker {
    fn default() -> Self {
        Self {
            last: None,
            was_recording: false,
            was_paused: false,
            first_recording_since_boot: true,
        }
    }
}

impl RideStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_state(&self) -> Option<RideState> {
        self.last
    }

    pub fn observe(&mut self, state: RideState) -> Option<RideEvent> {
        if self.last == Some(state) {
            return None;
        }

        let event = match state {
            RideState::Recording
                if matches!(self.last, None | Some(RideState::Idle))
                    && self.first_recording_since_boot =>
            {
                self.first_recording_since_boot = false;
                Some(RideEvent::Start)
            }
            RideState::Recording if self.last == Some(RideState::Paused) => Some(RideEvent::Resume),
            RideState::Paused if self.was_recording => Some(RideEvent::Pause),
            RideState::Idle if self.was_recording || self.was_paused => Some(RideEvent::Stop),
            _ => None,
        };

        self.last = Some(state);
        self.was_recording = state == RideState::Recording;
        self.was_paused = state == RideState::Paused;
        event
    }

    /// Consumes ride states until the stream ends or `cancel` fires.
    #[instrument(skip_all)]
    pub async fn run<S>(mut self, states: S, sink: RideEventSink, cancel: CancellationToken)
    where
        S: Stream<Item = RideState>,
    {
        let mut states = std::pin::pin!(states);
        loop {
            let state = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = states.next() => match next {
                    Some(state) => state,
                    None => break,
                },
            };
            match self.observe(state) {
                Some(event) => {
                    info!(%event, ?state, "ride transition");
                    sink.fan_out(event);
                }
                None => debug!(?state, "no transition"),
            }
        }
        debug!("ride state observation ended");
    }
}

/// Runs the notification gate and every webhook as independent tasks per event.
#[derive(Clone)]
pub struct RideEventSink {
    gate: Arc<NotificationGate>,
    webhooks: Arc<WebhookExecutor>,
    config: ConfigStore,
    tasks: TaskTracker,
}

impl RideEventSink {
    pub fn new(
        gate: Arc<NotificationGate>,
        webhooks: Arc<WebhookExecutor>,
        config: ConfigStore,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            gate,
            webhooks,
            config,
            tasks,
        }
    }

    /// Returns the number of tasks spawned.
    pub fn fan_out(&self, event: RideEvent) -> usize {
        let gate = Arc::clone(&self.gate);
        self.tasks.spawn(async move {
            let fired = gate.handle_event(event).await;
            debug!(%event, fired, "notification gate finished");
        });

        let ids: Vec<i64> = self.config.snapshot().webhooks.iter().map(|w| w.id).collect();
        for id in &ids {
            let webhooks = Arc::clone(&self.webhooks);
            let id = *id;
            self.tasks.spawn(async move {
                let sent = webhooks.handle_event(event, Some(id)).await;
                debug!(%event, webhook = id, sent, "webhook handler finished");
            });
        }
        1 + ids.len()
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{Clock, KeyValueStore, MemoryKvStore};
    use crate::config::{ConfigSnapshot, EngineConfig};
    use crate::dispatch::ProviderDispatcher;
    use crate::model::{Coordinates, NotificationConfig, Provider, SenderConfig, WebhookConfig};
    use crate::status::StatusBoard;
    use crate::testing::{FixedLocation, ManualClock, RecordingHttp};
    use RideState::{Idle, Paused, Recording};

    fn classify(states: &[RideState]) -> Vec<RideEvent> {
        let mut tracker = RideStateTracker::new();
        states.iter().filter_map(|s| tracker.observe(*s)).collect()
    }

    #[test]
    fn test_classifies_full_ride() {
        assert_eq!(
            classify(&[Recording, Recording, Paused, Recording, Idle]),
            vec![RideEvent::Start, RideEvent::Pause, RideEvent::Resume, RideEvent::Stop]
        );
    }

    #[test]
    fn test_start_fires_once_per_boot() {
        assert_eq!(
            classify(&[Idle, Recording, Idle, Recording, Idle]),
            vec![RideEvent::Start, RideEvent::Stop, RideEvent::Stop]
        );
    }

    #[test]
    fn test_stop_from_paused() {
        assert_eq!(
            classify(&[Recording, Paused, Paused, Idle]),
            vec![RideEvent::Start, RideEvent::Pause, RideEvent::Stop]
        );
    }

    #[test]
    fn test_initial_states_without_history() {
        assert_eq!(classify(&[Paused, Idle]), vec![RideEvent::Stop]);
        assert_eq!(classify(&[Idle, Idle]), Vec::<RideEvent>::new());
    }

    fn sink(
        http: Arc<RecordingHttp>,
        config: ConfigStore,
        clock: Arc<ManualClock>,
        cancel: &CancellationToken,
    ) -> (RideEventSink, Arc<NotificationGate>) {
        let settings = EngineConfig::default();
        let dispatcher = Arc::new(ProviderDispatcher::new(
            http.clone(),
            &settings,
            cancel.clone(),
        ));
        let gate = Arc::new(NotificationGate::new(
            dispatcher,
            config.clone(),
            clock.clone() as Arc<dyn Clock>,
            &settings,
        ));
        let board = StatusBoard::new(
            Arc::new(MemoryKvStore::new()) as Arc<dyn KeyValueStore>,
            config.clone(),
            clock as Arc<dyn Clock>,
            settings.timings.clone(),
            cancel.clone(),
        );
        let webhooks = Arc::new(WebhookExecutor::new(
            http,
            config.clone(),
            Arc::new(FixedLocation(Ok(Coordinates::default()))),
            board,
            &settings,
        ));
        let sink = RideEventSink::new(Arc::clone(&gate), webhooks, config, TaskTracker::new());
        (sink, gate)
    }

    #[tokio::test]
    async fn test_run_fans_out_to_gate_and_webhooks() {
        let http = RecordingHttp::replying(200, r#"{"sent":true}"#);
        let config = ConfigStore::new(ConfigSnapshot {
            notifications: vec![NotificationConfig {
                delay_intents: 0.0,
                phone_numbers: vec!["15550001111".into()],
                ..NotificationConfig::default()
            }],
            senders: vec![SenderConfig::new(Provider::ChatApi, "token")],
            webhooks: vec![
                WebhookConfig {
                    id: 1,
                    url: "https://hooks.example.com/a".into(),
                    enabled: true,
                    action_on_start: true,
                    ..WebhookConfig::default()
                },
                WebhookConfig {
                    id: 2,
                    url: "https://hooks.example.com/b".into(),
                    enabled: true,
                    ..WebhookConfig::default()
                },
            ],
        });
        let cancel = CancellationToken::new();
        let (sink, gate) = sink(http.clone(), config, ManualClock::at(42_000), &cancel);

        let states = futures::stream::iter([Idle, Recording]);
        RideStateTracker::new().run(states, sink.clone(), cancel).await;
        sink.tasks().close();
        sink.tasks().wait().await;

        let mut urls: Vec<String> = http.requests().into_iter().map(|r| r.url).collect();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                "https://gate.whapi.cloud/messages/text".to_string(),
                "https://hooks.example.com/a".to_string(),
            ]
        );
        assert_eq!(gate.last_fire_time(RideEvent::Start).await, Some(42_000));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let http = RecordingHttp::replying(200, "");
        let cancel = CancellationToken::new();
        let (sink, _) = sink(http.clone(), ConfigStore::default(), ManualClock::at(0), &cancel);
        cancel.cancel();

        RideStateTracker::new()
            .run(futures::stream::pending::<RideState>(), sink, cancel)
            .await;
        assert_eq!(http.count(), 0);
    }
}
