//! Retry with exponential backoff
//!
//! Delay before attempt `n + 1` is `base_delay * multiplier^(n - 1)`. No
//! state is shared between calls, so retries nest safely.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use lexa_common::config::ClassifierConfig;

/// Retry policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
        }
    }

    /// Single attempt, no backoff
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    pub fn from_classifier_config(config: &ClassifierConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            config.backoff_multiplier,
        )
    }

    /// Sleep after the given failed attempt (1-indexed)
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(0.0).powi(attempt as i32 - 1);
        Duration::from_nanos((self.base_delay.as_nanos() as f64 * factor).round() as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), 2.0)
    }
}

/// Retry `operation` on every error until `policy.max_attempts` is reached
///
/// Returns the last error once attempts are exhausted.
pub async fn with_retry<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    with_retry_when(operation_name, policy, operation, |_| true).await
}

/// Retry `operation` while `should_retry` accepts the error
///
/// Errors rejected by `should_retry` (e.g. a 4xx response) are returned
/// immediately without sleeping.
pub async fn with_retry_when<F, Fut, T, E, P>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation = operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !should_retry(&err) {
                    tracing::debug!(operation = operation_name, attempt, error = %err, "Error is not retryable");
                    return Err(err);
                }

                if attempt >= max_attempts {
                    tracing::warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %err,
                        "Operation failed, retries exhausted"
                    );
                    return Err(err);
                }

                let delay = policy.delay_after_attempt(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, will retry after backoff"
                );
                tokio::time::sleep(delay).await;
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
    fn test_delay_grows_geometrically() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), 3.0);
        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(300));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(4, Duration::from_millis(100), 2.0);
        let started = tokio::time::Instant::now();

        let c = calls.clone();
        let result: Result<u32, String> = with_retry("flaky", &policy, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("failure {}", n))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_when_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(10), 2.0);

        let c = calls.clone();
        let result: Result<(), String> = with_retry("always-down", &policy, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("failure {}", n))
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_secs(60), 2.0);

        let c = calls.clone();
        let result: Result<(), String> = with_retry_when(
            "bad-request",
            &policy,
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("400".to_string())
                }
            },
            |e| e != "400",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_retries_are_independent() {
        let inner_calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(2, Duration::from_millis(5), 1.0);

        let ic = inner_calls.clone();
        let result: Result<(), String> = with_retry("outer", &policy, || {
            let ic = ic.clone();
            async move {
                with_retry("inner", &policy, || {
                    let ic = ic.clone();
                    async move {
                        ic.fetch_add(1, Ordering::SeqCst);
                        Err::<(), String>("down".to_string())
                    }
                })
                .await
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(inner_calls.load(Ordering::SeqCst), 4);
    }
}
