use serde::{Deserialize, Serialize};
use std::fmt;
use secrecy::{ExposeSecret, SecretString};

// --- Ride state (consumed from the recording service) ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideState {
    Idle,
    Recording,
    Paused,
}

/// Semantic transition label derived from consecutive ride states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideEvent {
    Start,
    Stop,
    Pause,
    Resume,
    Custom,
}

impl RideEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for RideEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- StepStatus ---

/// Lifecycle of an interactive affordance. Rendered by the shell, mutated only by the core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Idle,
    First,
    Executing,
    Success,
    Error,
    NotAvailable,
    Cancel,
}

impl StepStatus {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::First => "FIRST",
            Self::Executing => "EXECUTING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::NotAvailable => "NOT_AVAILABLE",
            Self::Cancel => "CANCEL",
        }
    }

    /// Parses a status name coming back from the shell. Unknown names map to `Idle`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "FIRST" => Self::First,
            "EXECUTING" => Self::Executing,
            "SUCCESS" => Self::Success,
            "ERROR" => Self::Error,
            "NOT_AVAILABLE" => Self::NotAvailable,
            "CANCEL" => Self::Cancel,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// --- Targets ---

/// An interactive affordance whose status the core drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TargetId {
    /// Custom message slot (0 or 1).
    Message(usize),
    Webhook(i64),
}

impl TargetId {
    /// Stable key used for persisted records.
    pub fn storage_key(self) -> String {
        match self {
            Self::Message(index) => format!("message-{index}"),
            Self::Webhook(id) => format!("webhook-{id}"),
        }
    }

    pub fn from_storage_key(key: &str) -> Option<Self> {
        if let Some(rest) = key.strip_prefix("message-") {
            return rest.parse().ok().map(Self::Message);
        }
        if let Some(rest) = key.strip_prefix("webhook-") {
            return rest.parse().ok().map(Self::Webhook);
        }
        None
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

// --- Coordinates ---

/// Plain WGS84 pair. Not validated: degenerate input propagates through distance math.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

// --- Providers ---

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[default]
    ChatApi,
    SmsApi,
    EmailApi,
}

impl Provider {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChatApi => "chat",
            Self::SmsApi => "sms",
            Self::EmailApi => "email",
        }
    }

    /// Phone-based providers address recipients by number.
    pub const fn uses_phone(self) -> bool {
        matches!(self, Self::ChatApi | Self::SmsApi)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider credential. Redacted in `Debug`, wiped on drop.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(SecretString);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::new(key.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_blank(&self) -> bool {
        self.expose().trim().is_empty()
    }
}

impl Default for ApiKey {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl PartialEq for ApiKey {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for ApiKey {}

// Written back to the shell's settings store as a plain string.
impl Serialize for ApiKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderConfig {
    pub provider: Provider,
    #[serde(default)]
    pub api_key: ApiKey,
}

impl SenderConfig {
    pub fn new(provider: Provider, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: ApiKey::new(api_key),
        }
    }
}

// --- Notification config ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationConfig {
    pub active: bool,
    pub notify_on_start: bool,
    pub notify_on_stop: bool,
    pub notify_on_pause: bool,
    pub notify_on_resume: bool,
    pub start_message: String,
    pub stop_message: String,
    pub pause_message: String,
    pub resume_message: String,
    pub custom_messages: [String; 2],
    pub karoo_key: String,
    pub phone_numbers: Vec<String>,
    /// Index 0 is the sender address, index 1 the recipient.
    pub emails: Vec<String>,
    /// Minimum minutes between two notifications of the same kind.
    pub delay_intents: f64,
    pub active_provider: Provider,
    pub message_statuses: [StepStatus; 2],
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            active: true,
            notify_on_start: true,
            notify_on_stop: true,
            notify_on_pause: false,
            notify_on_resume: false,
            start_message: "I'm starting my ride".into(),
            stop_message: "I've finished my ride".into(),
            pause_message: "I've paused my ride".into(),
            resume_message: "I've resumed my ride".into(),
            custom_messages: [String::new(), String::new()],
            karoo_key: String::new(),
            phone_numbers: Vec::new(),
            emails: Vec::new(),
            delay_intents: 3.0,
            active_provider: Provider::ChatApi,
            message_statuses: [StepStatus::Idle; 2],
        }
    }
}

impl NotificationConfig {
    pub fn notifies_on(&self, event: RideEvent) -> bool {
        match event {
            RideEvent::Start => self.notify_on_start,
            RideEvent::Stop => self.notify_on_stop,
            RideEvent::Pause => self.notify_on_pause,
            RideEvent::Resume => self.notify_on_resume,
            RideEvent::Custom => false,
        }
    }

    pub fn template_for(&self, event: RideEvent) -> &str {
        match event {
            RideEvent::Start => &self.start_message,
            RideEvent::Stop => &self.stop_message,
            RideEvent::Pause => &self.pause_message,
            RideEvent::Resume => &self.resume_message,
            RideEvent::Custom => &self.custom_messages[0],
        }
    }

    pub fn custom_message(&self, index: usize) -> Option<&str> {
        self.custom_messages
            .get(index)
            .map(String::as_str)
            .filter(|m| !m.trim().is_empty())
    }
}

// --- Webhook config ---

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConfig {
    pub id: i64,
    pub name: String,
    pub url: String,
    /// Newline-delimited `Key: Value` pairs.
    pub header: String,
    pub post: String,
    pub enabled: bool,
    pub action_on_start: bool,
    pub action_on_stop: bool,
    pub action_on_pause: bool,
    pub action_on_resume: bool,
    pub action_on_custom: bool,
    pub only_if_location: bool,
    pub location: Coordinates,
    pub status: StepStatus,
}

impl WebhookConfig {
    pub fn triggers_on(&self, event: RideEvent) -> bool {
        match event {
            RideEvent::Start => self.action_on_start,
            RideEvent::Stop => self.action_on_stop,
            RideEvent::Pause => self.action_on_pause,
            RideEvent::Resume => self.action_on_resume,
            RideEvent::Custom => self.action_on_custom,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lenient_defaults_to_idle() {
        assert_eq!(StepStatus::parse_lenient("executing"), StepStatus::Executing);
        assert_eq!(StepStatus::parse_lenient(" SUCCESS "), StepStatus::Success);
        assert_eq!(StepStatus::parse_lenient("bogus"), StepStatus::Idle);
        assert_eq!(StepStatus::parse_lenient(""), StepStatus::Idle);
    }

    #[test]
    fn test_target_storage_key_roundtrip() {
        assert_eq!(TargetId::Webhook(7).storage_key(), "webhook-7");
        assert_eq!(
            TargetId::from_storage_key("message-1"),
            Some(TargetId::Message(1))
        );
        assert_eq!(
            TargetId::from_storage_key("webhook--3"),
            Some(TargetId::Webhook(-3))
        );
        assert_eq!(TargetId::from_storage_key("other-1"), None);
    }

    #[test]
    fn test_api_key_redacted() {
        let sender = SenderConfig::new(Provider::SmsApi, "secret-token");
        let printed = format!("{sender:?}");
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("[REDACTED]"));
    }

    #[test]
    fn test_sender_config_keeps_key_through_json() {
        let sender: SenderConfig =
            serde_json::from_str(r#"{"provider": "email_api", "apiKey": "re_123"}"#).unwrap();
        assert_eq!(sender.api_key.expose(), "re_123");
        assert!(!sender.api_key.is_blank());
        assert_eq!(
            serde_json::to_value(&sender).unwrap(),
            serde_json::json!({"provider": "email_api", "apiKey": "re_123"})
        );

        let keyless: SenderConfig = serde_json::from_str(r#"{"provider": "sms_api"}"#).unwrap();
        assert!(keyless.api_key.is_blank());
        assert_eq!(keyless, SenderConfig::new(Provider::SmsApi, ""));
    }

    #[test]
    fn test_webhook_defaults_from_sparse_json() {
        let webhook: WebhookConfig =
            serde_json::from_str(r#"{"id": 4, "url": "https://example.com"}"#).unwrap();
        assert!(!webhook.enabled);
        assert!(!webhook.triggers_on(RideEvent::Start));
        assert_eq!(webhook.status, StepStatus::Idle);
        assert_eq!(webhook.location, Coordinates::default());
    }

    #[test]
    fn test_notification_config_deserializes_partial_json() {
        let json = r#"{"notifyOnPause": true, "phoneNumbers": ["15550001111"], "activeProvider": "sms_api"}"#;
        let config: NotificationConfig = serde_json::from_str(json).unwrap();
        assert!(config.notify_on_pause);
        assert!(config.notify_on_start);
        assert_eq!(config.active_provider, Provider::SmsApi);
        assert_eq!(config.phone_numbers, vec!["15550001111".to_string()]);
    }

    #[test]
    fn test_custom_message_blank_is_none() {
        let mut config = NotificationConfig::default();
        config.custom_messages[1] = "On my way".into();
        assert_eq!(config.custom_message(0), None);
        assert_eq!(config.custom_message(1), Some("On my way"));
        assert_eq!(config.custom_message(5), None);
    }
}
