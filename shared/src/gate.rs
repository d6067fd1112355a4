//! Per-event cooldown and dedup in front of the provider dispatcher.

use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::Clock;
use crate::config::{ConfigSnapshot, ConfigStore, EngineConfig};
use crate::dispatch::ProviderDispatcher;
use crate::keyed::KeyedMutex;
use crate::model::{NotificationConfig, Provider, RideEvent};

pub const RECENT_SENT_CAPACITY: usize = 10;

fn embedded_timestamp(key: &str) -> u64 {
    key.rsplit_once('#')
        .and_then(|(_, ts)| ts.parse().ok())
        .unwrap_or(0)
}

pub struct NotificationGate {
    dispatcher: Arc<ProviderDispatcher>,
    config: ConfigStore,
    clock: Arc<dyn Clock>,
    min_cooldown_ms: u64,
    free_tier_cooldown_ms: u64,
    free_tier_key: String,
    tracking_url_base: String,
    last_fire: KeyedMutex<RideEvent, Option<u64>>,
    recent_sent: Mutex<VecDeque<String>>,
}

impl NotificationGate {
    pub fn new(
        dispatcher: Arc<ProviderDispatcher>,
        config: ConfigStore,
        clock: Arc<dyn Clock>,
        settings: &EngineConfig,
    ) -> Self {
        Self {
            dispatcher,
            config,
            clock,
            min_cooldown_ms: settings.min_cooldown_ms,
            free_tier_cooldown_ms: settings.free_tier_cooldown_ms,
            free_tier_key: settings.free_tier_key.clone(),
            tracking_url_base: settings.tracking_url_base.clone(),
            last_fire: KeyedMutex::new(),
            recent_sent: Mutex::new(VecDeque::with_capacity(RECENT_SENT_CAPACITY + 1)),
        }
    }

    /// Cooldown between two notifications of the same kind.
    pub fn min_interval_ms(&self, snapshot: &ConfigSnapshot) -> u64 {
        let Some(notification) = snapshot.notification() else {
            return self.min_cooldown_ms;
        };

        if notification.active_provider == Provider::SmsApi {
            let key = snapshot
                .sender_for(Provider::SmsApi)
                .map(|s| s.api_key.expose().trim())
                .unwrap_or_default();
            if key.is_empty() || key.eq_ignore_ascii_case(&self.free_tier_key) {
                return self.free_tier_cooldown_ms;
            }
        }

        let configured = if notification.delay_intents.is_finite() && notification.delay_intents > 0.0 {
            // Saturating float-to-int cast.
            (notification.delay_intents * 60_000.0) as u64
        } else {
            0
        };
        configured.max(self.min_cooldown_ms)
    }

    pub async fn last_fire_time(&self, event: RideEvent) -> Option<u64> {
        self.last_fire.read(&event).await
    }

    pub fn recent_sent_keys(&self) -> Vec<String> {
        self.recent_sent
            .lock()
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Gate a ride event against the current configuration at the clock's time.
    pub async fn handle_event(&self, event: RideEvent) -> bool {
        let snapshot = self.config.snapshot();
        self.handle_event_with_time_limit(event, self.clock.now_ms(), &snapshot)
            .await
    }

    /// Returns true when the gate let a send through, whatever the delivery outcome.
    #[instrument(skip(self, snapshot))]
    pub async fn handle_event_with_time_limit(
        &self,
        event: RideEvent,
        now: u64,
        snapshot: &ConfigSnapshot,
    ) -> bool {
        let min_interval = self.min_interval_ms(snapshot);

        let notification = {
            let mut last_fire = self.last_fire.lock(&event).await;
            if let Some(last) = *last_fire {
                if now.saturating_sub(last) < min_interval {
                    debug!(last, min_interval, "suppressed by cooldown");
                    return false;
                }
            }

            let Some(notification) = snapshot
                .notification()
                .filter(|n| n.active && n.notifies_on(event))
            else {
                debug!("no notification config enabled for event");
                return false;
            };

            *last_fire = Some(now);
            notification
        };

        let key = format!("{event}#{now}");
        if !self.remember(key) {
            debug!("already sent");
            return false;
        }

        let message = self.compose(notification, event);
        let delivered = self.deliver(snapshot, &message).await;
        if delivered {
            info!("event notification delivered");
        } else {
            warn!("event notification was not delivered to any recipient");
        }
        true
    }

    /// Inserts `key` into the recent-sent set. Returns false if it was already there.
    fn remember(&self, key: String) -> bool {
        let Ok(mut recent) = self.recent_sent.lock() else {
            return true;
        };
        if recent.contains(&key) {
            return false;
        }
        recent.push_back(key);
        while recent.len() > RECENT_SENT_CAPACITY {
            let oldest = recent
                .iter()
                .enumerate()
                .min_by_key(|(_, k)| embedded_timestamp(k))
                .map(|(i, _)| i);
            match oldest {
                Some(index) => {
                    recent.remove(index);
                }
                None => break,
            }
        }
        true
    }

    fn compose(&self, notification: &NotificationConfig, event: RideEvent) -> String {
        let template = notification.template_for(event).trim();
        let key = notification.karoo_key.trim();
        if key.is_empty() {
            template.to_string()
        } else {
            format!("{template} {}{key}", self.tracking_url_base)
        }
    }

    /// Sends free text through the current configuration, bypassing the cooldown.
    pub async fn deliver_text(&self, message: &str) -> bool {
        let snapshot = self.config.snapshot();
        self.deliver(&snapshot, message).await
    }

    /// Sends `message` to every recipient of the authoritative notification config in
    /// `snapshot`. True if at least one delivery succeeded.
    pub async fn deliver(&self, snapshot: &ConfigSnapshot, message: &str) -> bool {
        let Some(notification) = snapshot.notification() else {
            warn!("no notification config to send through");
            return false;
        };
        let provider = notification.active_provider;
        if !provider.uses_phone() {
            return self.dispatcher.dispatch(snapshot, provider, None, message).await;
        }

        let recipients: Vec<&str> = notification
            .phone_numbers
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        if recipients.is_empty() {
            warn!(%provider, "no recipient phone numbers configured");
            return false;
        }

        let results = join_all(
            recipients
                .iter()
                .map(|phone| self.dispatcher.dispatch(snapshot, provider, Some(*phone), message)),
        )
        .await;
        results.into_iter().any(|ok| ok)
    }
}
