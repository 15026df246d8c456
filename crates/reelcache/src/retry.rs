//! Retry-with-backoff shared by playlist and segment fetching.

use crate::error::CacheProxyError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retry attempts, not counting the initial attempt.
    pub max_retries: u32,
    /// Base delay. Actual delay = base * 2^attempt, capped at `max_delay`.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// Add random jitter of [0, base/2) to spread out retry storms.
    pub jitter: bool,
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Checked shift so misconfigured attempt counts saturate instead of
        // overflowing the Duration math.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_ms == 0 {
            return capped;
        }
        let extra = rand::rng().random_range(0..jitter_ms);
        (capped + Duration::from_millis(extra)).min(self.max_delay)
    }
}

/// Outcome of a single attempt, signalling retryability to the driver.
pub enum RetryAction<T> {
    Success(T),
    /// Timeout-class failure worth another attempt.
    Retry(CacheProxyError),
    /// Permanent failure, surfaced immediately.
    Fail(CacheProxyError),
}

/// Run `operation` with exponential backoff between retryable failures.
///
/// The closure receives the current attempt number (0-indexed). Callers
/// cancel by dropping the returned future, which also aborts any in-flight
/// attempt.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, CacheProxyError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    for attempt in 0..=policy.max_retries {
        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after timeout-class failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(CacheProxyError::internal("retry loop exited without result"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            jitter: false,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        assert_eq!(p.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(p.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(p.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&policy(3), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    RetryAction::Retry(CacheProxyError::Timeout {
                        reason: "stalled".to_string(),
                    })
                } else {
                    RetryAction::Success(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                RetryAction::Fail(CacheProxyError::playlist("bad manifest"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy(2), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                RetryAction::Retry(CacheProxyError::Timeout {
                    reason: "stalled".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(CacheProxyError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
