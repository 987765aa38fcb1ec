//! Per-caller rate limiting for mutating endpoints
//!
//! GCRA quotas from `governor`, keyed by caller id. State is in process
//! memory; with several instances behind a balancer each enforces its own
//! quota.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::Clock;
use governor::{DefaultKeyedRateLimiter, Quota};
use thiserror::Error;

/// Keys kept before stale buckets are swept
const RETAIN_SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rate limit '{limit}' exceeded, retry after {}s", retry_after.as_secs())]
pub struct RateLimitError {
    pub limit: String,
    pub retry_after: Duration,
}

impl RateLimitError {
    /// Whole seconds for a `Retry-After` header, never zero
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

/// Named quota applied independently to each caller
pub struct RateLimiter {
    name: String,
    limiter: DefaultKeyedRateLimiter<String>,
}

impl RateLimiter {
    /// Allow `per_minute` calls per caller per minute (minimum 1)
    pub fn per_minute(name: impl Into<String>, per_minute: u32) -> Self {
        let per_minute = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            name: name.into(),
            limiter: governor::RateLimiter::keyed(Quota::per_minute(per_minute)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume one cell of `caller`'s quota
    pub fn check(&self, caller: &str) -> Result<(), RateLimitError> {
        if self.limiter.len() > RETAIN_SWEEP_THRESHOLD {
            self.limiter.retain_recent();
        }

        match self.limiter.check_key(&caller.to_string()) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let retry_after = not_until.wait_time_from(self.limiter.clock().now());
                tracing::debug!(
                    limit = %self.name,
                    caller = %caller,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limit exceeded"
                );
                Err(RateLimitError {
                    limit: self.name.clone(),
                    retry_after,
                })
            }
        }
    }
}
