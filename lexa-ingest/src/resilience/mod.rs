//! Resilience kit for outbound calls
//!
//! - [`retry`]: retry with exponential backoff
//! - [`circuit_breaker`]: per-dependency three-state breaker
//! - [`rate_limiter`]: per-caller limits for user-triggered actions
//!
//! Composition used for the generative classifier: the breaker wraps the
//! retry loop, so one breaker failure is one call whose retries were all
//! exhausted.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitError, CircuitSnapshot,
    CircuitState,
};
pub use rate_limiter::{RateLimitError, RateLimiter};
pub use retry::{with_retry, with_retry_when, RetryPolicy};
