//! Ride-notification core: turns ride-state changes and button clicks into
//! provider messages and webhook calls, with per-affordance status tracking.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod click;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod gate;
pub mod geo;
pub mod keyed;
pub mod logging;
pub mod model;
pub mod retry;
pub mod status;
pub mod surface;
pub mod tracker;
pub mod webhook;

#[cfg(test)]
mod testing;

use thiserror::Error;

pub use click::{ClickInput, ClickSession, UnifiedClickCoordinator};
pub use config::{ConfigError, ConfigSnapshot, ConfigStore, EngineConfig};
pub use dispatch::{DispatchError, ProviderDispatcher};
pub use engine::{Engine, Recovered};
pub use gate::NotificationGate;
pub use model::{
    ApiKey, Coordinates, NotificationConfig, Provider, RideEvent, RideState, SenderConfig,
    StepStatus, TargetId, WebhookConfig,
};
pub use retry::{DeliveryOutcome, DeliveryRetryEngine, RetryPolicy};
pub use status::{JournalError, StatusBoard, StatusStateMachine, TransitionJournal};
pub use surface::ActionSurface;
pub use tracker::{RideEventSink, RideStateTracker};
pub use webhook::{WebhookError, WebhookExecutor};

/// Failures of setup-time operations. Runtime sends never surface errors; they
/// log and report `false`.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] capabilities::KvError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Http(#[from] capabilities::HttpError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts() {
        let err: Error = EngineConfig::from_json_str("{not json").unwrap_err().into();
        assert!(matches!(err, Error::Config(ConfigError::Parse(_))));
    }
}
