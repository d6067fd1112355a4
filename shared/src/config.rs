//! Engine settings and the always-current user configuration snapshot.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::capabilities::ValidatedUrl;
use crate::model::{NotificationConfig, Provider, SenderConfig, StepStatus, TargetId, WebhookConfig};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Engine settings
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEndpoints {
    pub chat_url: String,
    /// Substring in a chat response body that proves a message id was issued.
    pub chat_message_id_marker: String,
    pub sms_url: String,
    pub sms_success_marker: String,
    pub email_url: String,
    pub email_subject: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            chat_url: "https://gate.whapi.cloud/messages/text".into(),
            chat_message_id_marker: "\"id\"".into(),
            sms_url: "https://textbelt.com/text".into(),
            sms_success_marker: "\"success\":true".into(),
            email_url: "https://api.resend.com/emails".into(),
            email_subject: "Ride update".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusTimings {
    pub first_revert_ms: u64,
    /// Dwell in EXECUTING after a successful action before showing SUCCESS.
    pub executing_dwell_ms: u64,
    pub success_dwell_ms: u64,
    pub error_dwell_ms: u64,
}

impl Default for StatusTimings {
    fn default() -> Self {
        Self {
            first_revert_ms: 10_000,
            executing_dwell_ms: 10_000,
            success_dwell_ms: 5_000,
            error_dwell_ms: 10_000,
        }
    }
}

impl StatusTimings {
    pub fn first_revert(&self) -> Duration {
        Duration::from_millis(self.first_revert_ms)
    }

    pub fn executing_dwell(&self) -> Duration {
        Duration::from_millis(self.executing_dwell_ms)
    }

    pub fn success_dwell(&self) -> Duration {
        Duration::from_millis(self.success_dwell_ms)
    }

    pub fn error_dwell(&self) -> Duration {
        Duration::from_millis(self.error_dwell_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickThresholds {
    pub action_threshold_ms: u64,
    pub cancel_threshold_ms: u64,
}

impl Default for ClickThresholds {
    fn default() -> Self {
        Self {
            action_threshold_ms: 10_000,
            cancel_threshold_ms: 20_000,
        }
    }
}

impl ClickThresholds {
    pub fn action_threshold(&self) -> Duration {
        Duration::from_millis(self.action_threshold_ms)
    }

    pub fn cancel_threshold(&self) -> Duration {
        Duration::from_millis(self.cancel_threshold_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub providers: ProviderEndpoints,
    pub retry: RetryPolicy,
    pub http_ceiling_ms: u64,
    pub min_cooldown_ms: u64,
    pub free_tier_cooldown_ms: u64,
    pub free_tier_key: String,
    pub geofence_radius_km: f64,
    pub location_timeout_ms: u64,
    pub tracking_url_base: String,
    pub timings: StatusTimings,
    pub click: ClickThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            providers: ProviderEndpoints::default(),
            retry: RetryPolicy::default(),
            http_ceiling_ms: 60_000,
            min_cooldown_ms: 3 * 60 * 1000,
            free_tier_cooldown_ms: 24 * 60 * 60 * 1000,
            free_tier_key: "textbelt".into(),
            geofence_radius_km: 0.010,
            location_timeout_ms: 30_000,
            tracking_url_base: "https://dashboard.hammerhead.io/live/".into(),
            timings: StatusTimings::default(),
            click: ClickThresholds::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn http_ceiling(&self) -> Duration {
        Duration::from_millis(self.http_ceiling_ms)
    }

    pub fn location_timeout(&self) -> Duration {
        Duration::from_millis(self.location_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, url) in [
            ("chat_url", &self.providers.chat_url),
            ("sms_url", &self.providers.sms_url),
            ("email_url", &self.providers.email_url),
        ] {
            ValidatedUrl::new(url.as_str())
                .map_err(|e| ConfigError::Invalid(format!("{name}: {e}")))?;
        }
        if self.http_ceiling_ms == 0 {
            return Err(ConfigError::Invalid("http_ceiling_ms must be > 0".into()));
        }
        if !self.geofence_radius_km.is_finite() || self.geofence_radius_km < 0.0 {
            return Err(ConfigError::Invalid(
                "geofence_radius_km must be a non-negative number".into(),
            ));
        }
        if self.click.action_threshold_ms == 0 {
            return Err(ConfigError::Invalid(
                "click.action_threshold_ms must be > 0".into(),
            ));
        }
        if self.click.cancel_threshold_ms <= self.click.action_threshold_ms {
            return Err(ConfigError::Invalid(
                "click.cancel_threshold_ms must exceed the action threshold".into(),
            ));
        }
        self.retry.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}

// ============================================================================
// User configuration snapshot
// ============================================================================

/// Immutable view of the user's configuration collections.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigSnapshot {
    pub notifications: Vec<NotificationConfig>,
    pub senders: Vec<SenderConfig>,
    pub webhooks: Vec<WebhookConfig>,
}

impl ConfigSnapshot {
    /// The first notification config is authoritative.
    pub fn notification(&self) -> Option<&NotificationConfig> {
        self.notifications.first()
    }

    pub fn sender_for(&self, provider: Provider) -> Option<&SenderConfig> {
        self.senders.iter().find(|s| s.provider == provider)
    }

    /// Sender for the provider selected in the authoritative notification config.
    pub fn selected_sender(&self) -> Option<&SenderConfig> {
        self.notification()
            .and_then(|n| self.sender_for(n.active_provider))
    }

    pub fn webhook_by_id(&self, id: i64) -> Option<&WebhookConfig> {
        self.webhooks.iter().find(|w| w.id == id)
    }

    /// Webhook with `id`, or the first configured one.
    pub fn webhook(&self, id: Option<i64>) -> Option<&WebhookConfig> {
        match id {
            Some(id) => self.webhook_by_id(id).or_else(|| self.webhooks.first()),
            None => self.webhooks.first(),
        }
    }
}

/// Publishes configuration snapshots. Readers hold on to the `Arc` they read.
#[derive(Clone)]
pub struct ConfigStore {
    tx: Arc<watch::Sender<Arc<ConfigSnapshot>>>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(ConfigSnapshot::default())
    }
}

impl ConfigStore {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(snapshot));
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.tx.subscribe()
    }

    /// Replaces the whole snapshot.
    pub fn publish(&self, snapshot: ConfigSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    pub fn set_notifications(&self, notifications: Vec<NotificationConfig>) {
        self.tx
            .send_modify(|s| Arc::make_mut(s).notifications = notifications);
    }

    pub fn set_senders(&self, senders: Vec<SenderConfig>) {
        self.tx.send_modify(|s| Arc::make_mut(s).senders = senders);
    }

    pub fn set_webhooks(&self, webhooks: Vec<WebhookConfig>) {
        self.tx.send_modify(|s| Arc::make_mut(s).webhooks = webhooks);
    }

    /// Writes `status` into the config entry backing `target`. Returns whether an entry changed.
    pub fn mirror_status(&self, target: TargetId, status: StepStatus) -> bool {
        self.tx.send_if_modified(|snapshot| {
            let current = match target {
                TargetId::Webhook(id) => snapshot.webhook_by_id(id).map(|w| w.status),
                TargetId::Message(index) => snapshot
                    .notification()
                    .and_then(|n| n.message_statuses.get(index).copied()),
            };
            if current.is_none() || current == Some(status) {
                return false;
            }

            let snapshot = Arc::make_mut(snapshot);
            match target {
                TargetId::Webhook(id) => {
                    if let Some(w) = snapshot.webhooks.iter_mut().find(|w| w.id == id) {
                        w.status = status;
                    }
                }
                TargetId::Message(index) => {
                    if let Some(slot) = snapshot
                        .notifications
                        .first_mut()
                        .and_then(|n| n.message_statuses.get_mut(index))
                    {
                        *slot = status;
                    }
                }
            }
            true
        })
    }
}
