//! Routes a notification to the selected HTTP provider.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::capabilities::{execute_with_ceiling, HttpClient, HttpError, HttpRequest};
use crate::config::{ConfigSnapshot, EngineConfig, ProviderEndpoints};
use crate::model::Provider;
use crate::retry::DeliveryRetryEngine;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no sender configured for {0}")]
    MissingSender(Provider),
    #[error("{0} requires a recipient phone number")]
    MissingRecipient(Provider),
    #[error("email delivery requires a sender and a recipient address")]
    MissingEmails,
    #[error(transparent)]
    Http(#[from] HttpError),
}

#[derive(Serialize)]
struct ChatBody<'a> {
    to: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct SmsBody<'a> {
    phone: &'a str,
    message: &'a str,
    key: &'a str,
}

#[derive(Serialize)]
struct EmailBody<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: String,
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub struct ProviderDispatcher {
    http: Arc<dyn HttpClient>,
    endpoints: ProviderEndpoints,
    free_tier_key: String,
    ceiling: Duration,
    retry: DeliveryRetryEngine,
}

impl ProviderDispatcher {
    pub fn new(
        http: Arc<dyn HttpClient>,
        settings: &EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            http,
            endpoints: settings.providers.clone(),
            free_tier_key: settings.free_tier_key.clone(),
            ceiling: settings.http_ceiling(),
            retry: DeliveryRetryEngine::new(settings.retry.clone(), cancel),
        }
    }

    /// Delivers `message` through `provider` using the credentials in `snapshot`.
    /// Every failure is logged and reported as `false`.
    #[instrument(skip(self, snapshot, message))]
    pub async fn dispatch(
        &self,
        snapshot: &ConfigSnapshot,
        provider: Provider,
        recipient: Option<&str>,
        message: &str,
    ) -> bool {
        let result = match provider {
            Provider::ChatApi => self.send_chat(snapshot, recipient, message).await,
            Provider::SmsApi => self.send_sms(snapshot, recipient, message).await,
            Provider::EmailApi => self.send_email(snapshot, message).await,
        };
        match result {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(error = %e, "dispatch rejected");
                false
            }
        }
    }

    async fn send_chat(
        &self,
        snapshot: &ConfigSnapshot,
        recipient: Option<&str>,
        message: &str,
    ) -> Result<bool, DispatchError> {
        let to = recipient
            .filter(|r| !r.trim().is_empty())
            .ok_or(DispatchError::MissingRecipient(Provider::ChatApi))?;
        let sender = snapshot
            .sender_for(Provider::ChatApi)
            .ok_or(DispatchError::MissingSender(Provider::ChatApi))?;

        let build = || -> Result<HttpRequest, HttpError> {
            HttpRequest::post(self.endpoints.chat_url.as_str())?
                .with_bearer(sender.api_key.expose())?
                .with_json(&ChatBody { to, body: message })
        };
        // Surface configuration errors once instead of on every attempt.
        build()?;

        let build = &build;
        let http: &dyn HttpClient = &*self.http;
        let ceiling = self.ceiling;
        let marker = self.endpoints.chat_message_id_marker.as_str();
        let outcome = self
            .retry
            .send(Provider::ChatApi.as_str(), move || async move {
                let request = match build() {
                    Ok(request) => request,
                    Err(_) => return false,
                };
                match execute_with_ceiling(http, request, ceiling).await {
                    Ok(response) => {
                        response.is_success() || response.body_lossy().contains(marker)
                    }
                    Err(e) => {
                        warn!(error = %e, "chat attempt failed");
                        false
                    }
                }
            })
            .await;
        debug!(?outcome, "chat delivery finished");
        Ok(outcome.is_delivered())
    }

    async fn send_sms(
        &self,
        snapshot: &ConfigSnapshot,
        recipient: Option<&str>,
        message: &str,
    ) -> Result<bool, DispatchError> {
        let phone = recipient
            .filter(|r| !r.trim().is_empty())
            .ok_or(DispatchError::MissingRecipient(Provider::SmsApi))?;
        // No key configured means the shared free-tier key.
        let key = snapshot
            .sender_for(Provider::SmsApi)
            .filter(|s| !s.api_key.is_blank())
            .map_or(self.free_tier_key.as_str(), |s| s.api_key.expose());

        let request = HttpRequest::post(self.endpoints.sms_url.as_str())?.with_json(&SmsBody {
            phone,
            message,
            key,
        })?;
        let response = execute_with_ceiling(&*self.http, request, self.ceiling).await?;
        let body = response.body_lossy();
        debug!(status = response.status(), "sms gateway replied");
        Ok(response.is_success() && body.contains(self.endpoints.sms_success_marker.as_str()))
    }

    async fn send_email(&self, snapshot: &ConfigSnapshot, message: &str) -> Result<bool, DispatchError> {
        let sender = snapshot
            .sender_for(Provider::EmailApi)
            .ok_or(DispatchError::MissingSender(Provider::EmailApi))?;
        let emails = snapshot
            .notification()
            .map(|n| n.emails.as_slice())
            .unwrap_or_default();
        let (from, to) = match emails {
            [from, to, ..] if !from.trim().is_empty() && !to.trim().is_empty() => (from, to),
            _ => return Err(DispatchError::MissingEmails),
        };

        let request = HttpRequest::post(self.endpoints.email_url.as_str())?
            .with_bearer(sender.api_key.expose())?
            .with_json(&EmailBody {
                from,
                to,
                subject: &self.endpoints.email_subject,
                html: format!("<p>{}</p>", escape_html(message)),
            })?;
        let response = execute_with_ceiling(&*self.http, request, self.ceiling).await?;
        debug!(status = response.status(), "email gateway replied");
        Ok(response.is_success())
    }
}
