//! Health check endpoint
//!
//! Reports uptime, database reachability, circuit breaker states and the
//! last engine error.

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::resilience::CircuitState;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the database is unreachable or a circuit is open
    pub status: String,
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    /// "connected" or "unreachable"
    pub database: String,
    pub circuits: Vec<CircuitStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let database_ok = match crate::db::ping(&state.db).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Health check: database unreachable");
            false
        }
    };

    let circuits: Vec<CircuitStatus> = state
        .breakers
        .snapshots()
        .into_iter()
        .map(|s| CircuitStatus {
            name: s.name,
            state: s.state,
            consecutive_failures: s.consecutive_failures,
        })
        .collect();

    let degraded = !database_ok || circuits.iter().any(|c| c.state == CircuitState::Open);
    let last_error = state.last_error.read().await.clone();

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        module: "lexa-ingest".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        database: if database_ok { "connected" } else { "unreachable" }.to_string(),
        circuits,
        last_error,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
