//! Job API handlers
//!
//! POST /jobs, POST /jobs/:job_id/continue, POST /jobs/:job_id/cancel,
//! GET /jobs/:job_id, GET /jobs

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use lexa_common::jobs::{JobKind, JobStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    api::CallerId,
    error::ApiResult,
    models::{Job, SourceReference},
    AppState,
};

/// Caller key used when a start request carries no identity
const ANONYMOUS_CALLER: &str = "anonymous";

/// POST /jobs request
#[derive(Debug, Deserialize)]
pub struct StartJobRequest {
    pub kind: JobKind,
    pub source: SourceReference,
}

/// POST /jobs response
#[derive(Debug, Serialize)]
pub struct StartJobResponse {
    pub job_id: Uuid,
    pub total_units: u64,
    pub status: JobStatus,
}

/// POST /jobs/:job_id/continue request
#[derive(Debug, Default, Deserialize)]
pub struct ContinueRequest {
    #[serde(default)]
    pub from_index: Option<u64>,
}

/// POST /jobs/:job_id/continue response
#[derive(Debug, Serialize)]
pub struct ContinueResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub accepted: bool,
}

/// POST /jobs/:job_id/cancel request
#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /jobs/:job_id/cancel response
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub processed_count: u64,
    pub cancel_requested: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_list_limit")]
    pub limit: u32,
}

fn default_list_limit() -> u32 {
    50
}

/// POST /jobs
///
/// Stage the source and start processing in the background. Returns 202
/// with the job id and unit count.
pub async fn start_job(
    State(state): State<AppState>,
    caller: Option<CallerId>,
    Json(request): Json<StartJobRequest>,
) -> ApiResult<(StatusCode, Json<StartJobResponse>)> {
    let caller = caller.map(|c| c.0).unwrap_or_else(|| ANONYMOUS_CALLER.to_string());
    state.start_limiter.check(&caller)?;

    let job = state.engine.start_job(request.kind, request.source).await?;

    tracing::info!(
        job_id = %job.id,
        kind = %job.kind,
        total_units = job.total_units,
        caller = %caller,
        "Job accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(StartJobResponse {
            job_id: job.id,
            total_units: job.total_units,
            status: job.status,
        }),
    ))
}

/// POST /jobs/:job_id/continue
///
/// Acknowledges only; the chunk runs in the background. Terminal jobs are
/// acknowledged with `accepted: false`.
pub async fn continue_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    request: Option<Json<ContinueRequest>>,
) -> ApiResult<(StatusCode, Json<ContinueResponse>)> {
    let from_index = request.and_then(|Json(r)| r.from_index);
    let job = state.engine.continue_job(job_id, from_index).await?;

    tracing::debug!(job_id = %job_id, from_index = ?from_index, status = %job.status, "Continue trigger");

    Ok((
        StatusCode::ACCEPTED,
        Json(ContinueResponse {
            job_id,
            status: job.status,
            accepted: !job.status.is_terminal(),
        }),
    ))
}

/// POST /jobs/:job_id/cancel
///
/// Idempotent: cancelling a finished job returns its final status.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    CallerId(caller): CallerId,
    request: Option<Json<CancelRequest>>,
) -> ApiResult<Json<CancelResponse>> {
    if let Err(e) = state.cancel_limiter.check(&caller) {
        tracing::warn!(job_id = %job_id, caller = %caller, "Cancellation rate limited");
        return Err(e.into());
    }

    let reason = request.and_then(|Json(r)| r.reason);
    let job = state.engine.cancel(job_id, reason.as_deref()).await?;

    tracing::info!(job_id = %job_id, caller = %caller, status = %job.status, "Cancel request handled");

    Ok(Json(CancelResponse {
        job_id,
        status: job.status,
        processed_count: job.processed_count,
        cancel_requested: job.cancel_requested,
    }))
}

/// GET /jobs/:job_id
pub async fn get_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> ApiResult<Json<Job>> {
    Ok(Json(crate::db::jobs::get(&state.db, job_id).await?))
}

/// GET /jobs?limit=N
pub async fn list_jobs(State(state): State<AppState>, Query(query): Query<ListQuery>) -> ApiResult<Json<Vec<Job>>> {
    let limit = query.limit.clamp(1, 500);
    Ok(Json(crate::db::jobs::list(&state.db, limit).await?))
}

/// Build job routes
pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(start_job).get(list_jobs))
        .route("/jobs/events", get(super::job_event_stream))
        .route("/jobs/:job_id", get(get_job))
        .route("/jobs/:job_id/continue", post(continue_job))
        .route("/jobs/:job_id/cancel", post(cancel_job))
}
