//! Cyclic retry protocol for outbound message delivery.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub cycles: u32,
    pub attempts_per_cycle: u32,
    /// Delay before each attempt (except the very first), indexed by cycle.
    /// Cycles past the end reuse the last entry.
    pub attempt_delay_ms: Vec<u64>,
    /// Pause after cycle `i` when more cycles remain.
    pub cycle_pause_ms: Vec<u64>,
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            cycles: 3,
            attempts_per_cycle: 3,
            attempt_delay_ms: vec![60_000, 120_000, 180_000],
            cycle_pause_ms: vec![5 * 60_000, 10 * 60_000],
            attempt_timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.cycles == 0 {
            return Err("retry.cycles must be > 0".into());
        }
        if self.attempts_per_cycle == 0 {
            return Err("retry.attempts_per_cycle must be > 0".into());
        }
        if self.attempt_timeout_ms == 0 {
            return Err("retry.attempt_timeout_ms must be > 0".into());
        }
        if self.attempt_delay_ms.is_empty() {
            return Err("retry.attempt_delay_ms must not be empty".into());
        }
        Ok(())
    }

    pub fn max_attempts(&self) -> u32 {
        self.cycles.saturating_mul(self.attempts_per_cycle)
    }

    pub fn attempt_delay(&self, cycle: u32) -> Duration {
        let ms = self
            .attempt_delay_ms
            .get(cycle as usize)
            .or_else(|| self.attempt_delay_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    pub fn cycle_pause(&self, cycle: u32) -> Duration {
        Duration::from_millis(self.cycle_pause_ms.get(cycle as usize).copied().unwrap_or(0))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Exhausted { attempts: u32 },
    /// Cancelled before a result; not scored as a failed attempt.
    Cancelled { attempts: u32 },
}

impl DeliveryOutcome {
    pub fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn attempts(self) -> u32 {
        match self {
            Self::Delivered { attempts }
            | Self::Exhausted { attempts }
            | Self::Cancelled { attempts } => attempts,
        }
    }
}

/// Provider-agnostic retry driver. Each attempt is a closure returning success.
#[derive(Clone, Debug)]
pub struct DeliveryRetryEngine {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl DeliveryRetryEngine {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns false when cancellation fired first.
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    #[tracing::instrument(skip(self, attempt), fields(max_attempts = self.policy.max_attempts()))]
    pub async fn send<F, Fut>(&self, label: &str, mut attempt: F) -> DeliveryOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let timeout = self.policy.attempt_timeout();
        let mut attempts = 0u32;

        for cycle in 0..self.policy.cycles {
            for _ in 0..self.policy.attempts_per_cycle {
                if attempts > 0 && !self.pause(self.policy.attempt_delay(cycle)).await {
                    info!(attempts, "delivery cancelled");
                    return DeliveryOutcome::Cancelled { attempts };
                }

                attempts += 1;
                let run = AssertUnwindSafe(async { attempt().await }).catch_unwind();
                let result = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        info!(attempts, "delivery cancelled mid-attempt");
                        return DeliveryOutcome::Cancelled { attempts: attempts - 1 };
                    }
                    result = tokio::time::timeout(timeout, run) => result,
                };

                match result {
                    Ok(Ok(true)) => {
                        debug!(attempts, cycle, "delivery succeeded");
                        return DeliveryOutcome::Delivered { attempts };
                    }
                    Ok(Ok(false)) => debug!(attempts, cycle, "delivery attempt failed"),
                    Ok(Err(_)) => error!(attempts, cycle, "delivery attempt panicked"),
                    Err(_) => warn!(attempts, cycle, ?timeout, "delivery attempt timed out"),
                }
            }

            let more_cycles = cycle + 1 < self.policy.cycles;
            if more_cycles && !self.pause(self.policy.cycle_pause(cycle)).await {
                info!(attempts, "delivery cancelled between cycles");
                return DeliveryOutcome::Cancelled { attempts };
            }
        }

        warn!(attempts, "delivery exhausted all cycles");
        DeliveryOutcome::Exhausted { attempts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn engine() -> DeliveryRetryEngine {
        DeliveryRetryEngine::new(RetryPolicy::default(), CancellationToken::new())
    }

    #[test]
    fn test_policy_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 9);
        assert_eq!(policy.attempt_delay(0), Duration::from_secs(60));
        assert_eq!(policy.attempt_delay(2), Duration::from_secs(180));
        assert_eq!(policy.attempt_delay(7), Duration::from_secs(180));
        assert_eq!(policy.cycle_pause(1), Duration::from_secs(600));
        assert_eq!(policy.cycle_pause(2), Duration::ZERO);
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        let policy = RetryPolicy {
            cycles: 0,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_nine_attempts() {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();

        let outcome = engine()
            .send("always-fails", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                false
            })
            .await;

        assert_eq!(outcome, DeliveryOutcome::Exhausted { attempts: 9 });
        assert_eq!(calls.load(Ordering::SeqCst), 9);
        // 2×60 + 300 + 3×120 + 600 + 3×180
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1920), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(1921), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_fifth_attempt_success() {
        let calls = &AtomicU32::new(0);

        let outcome = engine()
            .send("fifth", move || async move {
                calls.fetch_add(1, Ordering::SeqCst) + 1 == 5
            })
            .await;

        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 5 });
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_counts_as_failed_attempt() {
        let calls = &AtomicU32::new(0);

        let outcome = engine()
            .send("panics-once", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("provider blew up");
                }
                true
            })
            .await;

        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_times_out() {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();

        let outcome = engine()
            .send("hangs-once", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    std::future::pending::<()>().await;
                }
                true
            })
            .await;

        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 2 });
        assert_eq!(started.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_remaining_attempts() {
        let cancel = CancellationToken::new();
        let engine = DeliveryRetryEngine::new(RetryPolicy::default(), cancel.clone());
        let calls = Arc::new(AtomicU32::new(0));

        let counted = Arc::clone(&calls);
        let task = tokio::spawn(async move {
            engine
                .send("cancelled", move || {
                    let counted = Arc::clone(&counted);
                    async move {
                        counted.fetch_add(1, Ordering::SeqCst);
                        false
                    }
                })
                .await
        });

        tokio::time::sleep(Duration::from_secs(90)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), DeliveryOutcome::Cancelled { attempts: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
