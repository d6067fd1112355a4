//! Subscriber setup for hosts that don't install their own.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "ride_notify=info";

/// Installs a global fmt subscriber. `RUST_LOG` takes precedence over `default_filter`.
/// Returns false when a subscriber is already installed.
pub fn init(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
