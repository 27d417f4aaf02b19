//! Reconnection mechanism
//!
//! Connect-time retries use a fixed delay between attempts. Between failed
//! reconnect cycles the scheduler backs off linearly via [`linear_backoff`].

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound of linear back-off steps between reconnect cycles
pub const MAX_BACKOFF_STEPS: u32 = 10;

/// Reconnection error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    /// Every attempt of the cycle failed
    #[error("Maximum reconnection attempts ({attempts}) exceeded: {last_error}")]
    MaxAttemptsExceeded { attempts: u32, last_error: String },

    /// Reconnection was cancelled
    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Retry policy for one connect cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per cycle, at least one is always made
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(2000))
    }
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconnectStats {
    /// Individual connect attempts
    pub total_attempts: u64,
    /// Cycles that ended connected
    pub successful_connects: u64,
    /// Cycles that exhausted every attempt
    pub failed_connects: u64,
    /// Established connections later lost (keep-alive or forced reconnect)
    pub lost_connections: u64,
    #[serde(skip)]
    pub last_connected: Option<Instant>,
    pub last_error: Option<String>,
}

/// Linear back-off: `interval × failed_cycles`, at least one interval and
/// at most [`MAX_BACKOFF_STEPS`] intervals
pub fn linear_backoff(interval: Duration, failed_cycles: u32) -> Duration {
    interval * failed_cycles.clamp(1, MAX_BACKOFF_STEPS)
}

/// Runs connect cycles with a fixed inter-attempt delay
#[derive(Debug)]
pub struct ReconnectHelper {
    label: String,
    policy: RetryPolicy,
    stats: Arc<Mutex<ReconnectStats>>,
}

impl ReconnectHelper {
    pub fn new(label: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            label: label.into(),
            policy,
            stats: Arc::new(Mutex::new(ReconnectStats::default())),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Shared handle on the statistics, readable without waiting for a cycle
    pub fn stats_handle(&self) -> Arc<Mutex<ReconnectStats>> {
        Arc::clone(&self.stats)
    }

    pub fn mark_lost(&self) {
        self.stats.lock().lost_connections += 1;
    }

    /// Execute one connect cycle
    ///
    /// Calls `connect_fn` up to `max_attempts` times, sleeping `interval`
    /// between attempts, and returns the attempt number that succeeded.
    /// Cancelling `cancel` aborts the cycle during the delay or after a
    /// failed attempt.
    pub async fn run<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        mut connect_fn: F,
    ) -> Result<u32, ReconnectError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                info!(
                    "[RETRY] {} {}/{} in {}ms - {}",
                    self.label,
                    attempt,
                    max_attempts,
                    self.policy.interval.as_millis(),
                    last_error
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
                    _ = tokio::time::sleep(self.policy.interval) => {},
                }
            }
            if cancel.is_cancelled() {
                return Err(ReconnectError::Cancelled);
            }

            self.stats.lock().total_attempts += 1;
            let started = Instant::now();

            match connect_fn(attempt).await {
                Ok(()) => {
                    debug!(
                        "{} connected after {:?} (attempt {})",
                        self.label,
                        started.elapsed(),
                        attempt
                    );
                    let mut stats = self.stats.lock();
                    stats.successful_connects += 1;
                    stats.last_connected = Some(Instant::now());
                    stats.last_error = None;
                    return Ok(attempt);
                },
                Err(e) => {
                    warn!(
                        "{} connect attempt {}/{} failed: {}",
                        self.label, attempt, max_attempts, e
                    );
                    last_error = e.to_string();
                    if cancel.is_cancelled() {
                        return Err(ReconnectError::Cancelled);
                    }
                },
            }
        }

        let mut stats = self.stats.lock();
        stats.failed_connects += 1;
        stats.last_error = Some(last_error.clone());
        Err(ReconnectError::MaxAttemptsExceeded {
            attempts: max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn helper(max_attempts: u32) -> ReconnectHelper {
        ReconnectHelper::new(
            "test",
            RetryPolicy::fixed(max_attempts, Duration::from_millis(100)),
        )
    }

    #[test]
    fn test_linear_backoff() {
        let interval = Duration::from_millis(100);
        assert_eq!(linear_backoff(interval, 0), Duration::from_millis(100));
        assert_eq!(linear_backoff(interval, 1), Duration::from_millis(100));
        assert_eq!(linear_backoff(interval, 3), Duration::from_millis(300));
        assert_eq!(linear_backoff(interval, 50), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_then_give_up() {
        let helper = helper(3);
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = helper
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("refused") }
            })
            .await;

        assert_eq!(
            result,
            Err(ReconnectError::MaxAttemptsExceeded {
                attempts: 3,
                last_error: "refused".to_string()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two fixed delays, none before the first attempt
        assert_eq!(started.elapsed(), Duration::from_millis(200));

        let stats = helper.stats_handle().lock().clone();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.failed_connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_retry() {
        let helper = helper(3);
        let calls = AtomicU32::new(0);

        let attempt = helper
            .run(&CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err("refused")
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(attempt, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stats = helper.stats_handle().lock().clone();
        assert_eq!(stats.successful_connects, 1);
        assert!(stats.last_connected.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay() {
        let helper = helper(5);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            canceller.cancel();
        });

        let result = helper
            .run(&cancel, |_| async { Err::<(), _>("refused") })
            .await;
        assert_eq!(result, Err(ReconnectError::Cancelled));
        assert_eq!(helper.stats_handle().lock().total_attempts, 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let helper = helper(0);
        let result = helper
            .run(&CancellationToken::new(), |_| async { Ok::<(), &str>(()) })
            .await;
        assert_eq!(result, Ok(1));
    }
}
