//! lexa-ingest library interface
//!
//! Dictionary import and corpus annotation as resumable chunked jobs.
//! Exposes the service wiring (`AppState`, `build_router`) for the binary and
//! for integration tests.

pub mod api;
pub mod cascade;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod parser;
pub mod resilience;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use lexa_common::config::RateLimitConfig;
use lexa_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::engine::ChunkedJobEngine;
use crate::resilience::{CircuitBreakerRegistry, RateLimiter};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    pub engine: ChunkedJobEngine,
    /// Per-dependency circuit breakers (reported by /health)
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// Per-caller limit on cancellation requests
    pub cancel_limiter: Arc<RateLimiter>,
    /// Per-caller limit on job creation
    pub start_limiter: Arc<RateLimiter>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        engine: ChunkedJobEngine,
        breakers: Arc<CircuitBreakerRegistry>,
        rate_limit: &RateLimitConfig,
    ) -> Self {
        Self {
            db: engine.db().clone(),
            event_bus: engine.event_bus().clone(),
            last_error: engine.last_error(),
            engine,
            breakers,
            cancel_limiter: Arc::new(RateLimiter::per_minute("cancel", rate_limit.cancel_per_minute)),
            start_limiter: Arc::new(RateLimiter::per_minute("start", rate_limit.start_per_minute)),
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::job_routes())
        .merge(api::health_routes())
        .with_state(state)
}
