//! Retry utilities with exponential backoff.
//!
//! The broker retries each failing handler independently. The delay before
//! retry `n` (1-based) is `initial_delay × backoff_factor^(n-1)`, capped at
//! `max_delay`. Each delay is derived from the attempt number alone, so a
//! capped delay never feeds back into later ones.
//!
//! # Example
//!
//! ```rust
//! use event_broker::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy {
//!     max_retries: 3,
//!     initial_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_millis(300),
//!     backoff_factor: 2.0,
//! };
//!
//! assert_eq!(policy.delay_for(1), Duration::from_millis(100));
//! assert_eq!(policy.delay_for(2), Duration::from_millis(200));
//! assert_eq!(policy.delay_for(3), Duration::from_millis(300));
//! ```

use crate::config::duration_ms;
use crate::error::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Configuration for handler retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Multiplier applied per retry (typically 2.0)
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy for fast retries, mostly useful in tests.
    pub fn fast() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
        }
    }

    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }

    /// Delay before retry `attempt` (1-based). Attempt 0 is the initial
    /// call and has no delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = (attempt - 1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let max_secs = self.max_delay.as_secs_f64();

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Run `f` until it succeeds or the retry budget is spent.
///
/// `on_retry` is invoked with the attempt number just before each retry.
/// Cancelling `cancel` while waiting out a backoff delay aborts with
/// [`BrokerError::Cancelled`]. Lifecycle errors are never retried.
pub async fn with_retry<F, Fut, T, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: R,
    mut f: F,
) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
    R: FnMut(u32),
{
    let mut attempt: u32 = 0;

    loop {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(retries = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_lifecycle() => return Err(e),
            Err(e) if attempt >= policy.max_retries => {
                tracing::error!(
                    attempts = attempt + 1,
                    error = %e,
                    "All retry attempts exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                let delay = policy.delay_for(attempt);

                tracing::warn!(
                    attempt = attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!(attempt = attempt, "Retry cancelled");
                        return Err(BrokerError::Cancelled);
                    }
                    _ = sleep(delay) => {}
                }

                on_retry(attempt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
        assert_eq!(policy.backoff_factor, 2.0);
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        };

        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let retries_clone = retries.clone();

        let result = with_retry(
            &RetryPolicy::fast(),
            &CancellationToken::new(),
            |_| {
                retries_clone.fetch_add(1, Ordering::SeqCst);
            },
            || {
                let counter = counter_clone.clone();
                async move {
                    let count = counter.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err(BrokerError::handler("not yet"))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_attempts() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::fast()
        };
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: BrokerResult<()> = with_retry(&policy, &CancellationToken::new(), |_| {}, || {
            let counter = counter_clone.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::handler(format!("failure {n}")))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().to_string(), "failure 2");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_lifecycle_errors_are_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: BrokerResult<()> =
            with_retry(&RetryPolicy::fast(), &CancellationToken::new(), |_| {}, || {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BrokerError::QueueFull)
                }
            })
            .await;

        assert!(matches!(result, Err(BrokerError::QueueFull)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_backoff() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            backoff_factor: 1.0,
        };
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: BrokerResult<()> = with_retry(&policy, &cancel, |_| {}, || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::handler("down"))
            }
        })
        .await;

        assert!(matches!(result, Err(BrokerError::Cancelled)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_wins_over_zero_delay() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let retries = Arc::new(AtomicU32::new(0));
        let retries_clone = retries.clone();

        for _ in 0..20 {
            counter.store(0, Ordering::SeqCst);
            let result: BrokerResult<()> = with_retry(
                &policy,
                &cancel,
                |_| {
                    retries_clone.fetch_add(1, Ordering::SeqCst);
                },
                || {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(BrokerError::handler("down"))
                    }
                },
            )
            .await;

            assert!(matches!(result, Err(BrokerError::Cancelled)));
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        assert_eq!(retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_elapsed() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            backoff_factor: 2.0,
        };
        let start = tokio::time::Instant::now();

        let result: BrokerResult<()> = with_retry(&policy, &CancellationToken::new(), |_| {}, || async {
            Err(BrokerError::handler("down"))
        })
        .await;

        assert!(result.is_err());
        // 100ms + 200ms + 250ms (capped)
        assert!(start.elapsed() >= Duration::from_millis(550));
    }
}
