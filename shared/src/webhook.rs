//! User-configured webhooks: trigger gates, request construction, and the
//! status-driven execution path.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    execute_with_ceiling, HttpClient, HttpError, HttpHeaders, HttpRequest, LocationError,
    LocationSource,
};
use crate::config::{ConfigStore, EngineConfig};
use crate::geo;
use crate::model::{RideEvent, TargetId, WebhookConfig};
use crate::status::StatusBoard;

const DEFAULT_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook URL: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Parses newline-delimited `Key: Value` text. Lines without a key are skipped.
pub fn parse_headers(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Default JSON content type merged with the custom headers; custom wins.
pub fn build_headers(raw: &str) -> HttpHeaders {
    let mut headers = HttpHeaders::from(vec![(
        "Content-Type".to_string(),
        DEFAULT_CONTENT_TYPE.to_string(),
    )]);
    for (name, value) in parse_headers(raw) {
        if let Err(e) = headers.insert(name.as_str(), value) {
            warn!(header = %name, error = %e, "skipping custom header");
        }
    }
    headers
}

/// `Key: Value` lines as a flat JSON object. `None` if any non-empty line is malformed.
fn lines_to_json(text: &str) -> Option<String> {
    let mut object = serde_json::Map::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (key, value) = line.split_once(':')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        object.insert(key.to_string(), serde_json::Value::String(value.trim().to_string()));
    }
    serde_json::to_string(&object).ok()
}

/// Request body for the configured POST text under `content_type`.
pub fn build_body(post: &str, content_type: &str) -> Option<String> {
    if post.trim().is_empty() {
        return None;
    }
    if !content_type.to_ascii_lowercase().contains("json") {
        return Some(post.to_string());
    }
    let trimmed = post.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(post.to_string());
    }
    Some(lines_to_json(post).unwrap_or_else(|| post.to_string()))
}

pub fn build_request(config: &WebhookConfig) -> Result<HttpRequest, WebhookError> {
    let url = config.url.trim();
    if !url.starts_with("http") {
        return Err(WebhookError::InvalidUrl(url.to_string()));
    }
    let headers = build_headers(&config.header);
    let content_type = headers
        .get("Content-Type")
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();

    let request = HttpRequest::post(url)
        .map_err(|e| WebhookError::InvalidUrl(e.to_string()))?
        .with_headers(headers);
    match build_body(&config.post, &content_type) {
        Some(body) => Ok(request.with_body(body.into_bytes())?),
        None => Ok(request),
    }
}

pub struct WebhookExecutor {
    http: Arc<dyn HttpClient>,
    config: ConfigStore,
    location: Arc<dyn LocationSource>,
    board: StatusBoard,
    ceiling: Duration,
    radius_km: f64,
    location_timeout: Duration,
}

impl WebhookExecutor {
    pub fn new(
        http: Arc<dyn HttpClient>,
        config: ConfigStore,
        location: Arc<dyn LocationSource>,
        board: StatusBoard,
        settings: &EngineConfig,
    ) -> Self {
        Self {
            http,
            config,
            location,
            board,
            ceiling: settings.http_ceiling(),
            radius_km: settings.geofence_radius_km,
            location_timeout: settings.location_timeout(),
        }
    }

    /// Sends the webhook and reports whether it answered 2xx.
    pub async fn send(&self, config: &WebhookConfig) -> Result<bool, WebhookError> {
        let request = build_request(config)?;
        let response = execute_with_ceiling(&*self.http, request, self.ceiling).await?;
        debug!(webhook = config.id, status = response.status(), "webhook replied");
        Ok(response.is_success())
    }

    async fn send_logged(&self, config: &WebhookConfig) -> bool {
        match self.send(config).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(webhook = config.id, "webhook returned a non-success status");
                false
            }
            Err(e) => {
                warn!(webhook = config.id, error = %e, "webhook send failed");
                false
            }
        }
    }

    async fn near_target(&self, config: &WebhookConfig) -> bool {
        let lookup = tokio::time::timeout(self.location_timeout, self.location.current())
            .await
            .unwrap_or(Err(LocationError::Timeout(self.location_timeout)));
        match lookup {
            Ok(current) => {
                let distance = geo::distance_km(current, config.location);
                let near = geo::within_radius(current, config.location, self.radius_km);
                debug!(webhook = config.id, distance_km = distance, near, "geofence check");
                near
            }
            Err(e) => {
                warn!(webhook = config.id, error = %e, "location lookup failed, geofence not satisfied");
                false
            }
        }
    }

    /// Fires the webhook for a ride event if its trigger flag and geofence allow it.
    #[instrument(skip(self))]
    pub async fn handle_event(&self, event: RideEvent, webhook_id: Option<i64>) -> bool {
        let snapshot = self.config.snapshot();
        let Some(config) = snapshot.webhook(webhook_id) else {
            debug!("no webhook configured");
            return false;
        };
        if !config.enabled {
            debug!(webhook = config.id, "webhook disabled");
            return false;
        }
        if !config.triggers_on(event) {
            return false;
        }
        if config.only_if_location && !self.near_target(config).await {
            info!(webhook = config.id, "outside geofence, skipping");
            return false;
        }
        self.send_logged(config).await
    }

    /// Manual invocation that skips the trigger and location gates.
    #[instrument(skip(self))]
    pub async fn trigger_webhook(&self, webhook_id: i64) -> bool {
        let snapshot = self.config.snapshot();
        match snapshot.webhook_by_id(webhook_id) {
            Some(config) => self.send_logged(config).await,
            None => {
                warn!("manual trigger for unknown webhook");
                false
            }
        }
    }

    /// Sends the webhook while driving its status through EXECUTING and SUCCESS or ERROR.
    #[instrument(skip(self))]
    pub async fn execute_webhook_with_state_transitions(&self, webhook_id: Option<i64>) -> bool {
        let snapshot = self.config.snapshot();
        let Some(config) = snapshot.webhook(webhook_id) else {
            warn!("no webhook to execute");
            return false;
        };
        self.board
            .run_action(TargetId::Webhook(config.id), self.send_logged(config))
            .await
    }
}
