use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::model::Coordinates;

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("location unavailable: {0}")]
    Unavailable(String),
    #[error("location lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("location stream closed")]
    Closed,
}

/// Current device position supplied by the host.
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn current(&self) -> Result<Coordinates, LocationError>;
}

/// Takes the first available value from a position stream published by the shell.
#[derive(Clone)]
pub struct WatchLocation {
    rx: watch::Receiver<Option<Coordinates>>,
    timeout: Duration,
}

impl WatchLocation {
    pub fn new(rx: watch::Receiver<Option<Coordinates>>) -> Self {
        Self {
            rx,
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl LocationSource for WatchLocation {
    async fn current(&self) -> Result<Coordinates, LocationError> {
        let mut rx = self.rx.clone();
        let wait = async move {
            let value = rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| LocationError::Closed)?;
            (*value).ok_or(LocationError::Closed)
        };
        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| LocationError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_first_fix() {
        let (tx, rx) = watch::channel(None);
        let source = WatchLocation::new(rx);

        let lookup = tokio::spawn(async move { source.current().await });
        tokio::time::sleep(Duration::from_secs(2)).await;
        tx.send(Some(Coordinates::new(45.0, 7.0))).unwrap();

        assert_eq!(lookup.await.unwrap(), Ok(Coordinates::new(45.0, 7.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_fix() {
        let (_tx, rx) = watch::channel(None);
        let source = WatchLocation::new(rx).with_timeout(Duration::from_secs(5));
        assert_eq!(
            source.current().await,
            Err(LocationError::Timeout(Duration::from_secs(5)))
        );
    }

    #[tokio::test]
    async fn test_closed_stream_errors() {
        let (tx, rx) = watch::channel(None);
        drop(tx);
        let source = WatchLocation::new(rx);
        assert_eq!(source.current().await, Err(LocationError::Closed));
    }
}
