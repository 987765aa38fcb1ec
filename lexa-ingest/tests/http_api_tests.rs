//! HTTP API integration tests
//!
//! Requests go through the full router with `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use lexa_common::config::{EngineConfig, RateLimitConfig};
use lexa_common::db::init_memory_database;
use lexa_common::events::EventBus;
use lexa_common::jobs::JobKind;
use lexa_ingest::api::CALLER_ID_HEADER;
use lexa_ingest::engine::{ChunkedJobEngine, DictionaryImportProcessor};
use lexa_ingest::models::SourceReference;
use lexa_ingest::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry};
use lexa_ingest::{build_router, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const SMALL_DICTIONARY: &str = "*abacate*,\nFruto do abacateiro.\n\n*bacia*,\nVaso largo e raso.\n\n*cacimba*,\nPoço raso.\n";

async fn test_state() -> AppState {
    let db = init_memory_database().await.unwrap();
    let event_bus = EventBus::new(256);
    let engine = ChunkedJobEngine::new(db, event_bus.clone(), EngineConfig::default())
        .with_processor(Arc::new(DictionaryImportProcessor));
    let breakers = Arc::new(CircuitBreakerRegistry::with_event_bus(event_bus));
    AppState::new(engine, breakers, &RateLimitConfig::default())
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

fn cancel_request(job_id: Uuid, caller: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/jobs/{}/cancel", job_id))
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(caller) = caller {
        builder = builder.header(CALLER_ID_HEADER, caller);
    }
    builder
        .body(Body::from(json!({ "reason": "test" }).to_string()))
        .unwrap()
}

async fn staged_job(state: &AppState) -> Uuid {
    state
        .engine
        .create_job(JobKind::DictionaryImport, SourceReference::Inline(SMALL_DICTIONARY.to_string()))
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_health_reports_ok() {
    let state = test_state().await;
    let app = build_router(state);

    let (status, _, body) = send(&app, Request::builder().uri("/health").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "lexa-ingest");
    assert_eq!(body["database"], "connected");
    assert_eq!(body["circuits"], json!([]));
    assert!(body.get("last_error").is_none());
}

#[tokio::test]
async fn test_health_is_degraded_while_a_circuit_is_open() {
    let state = test_state().await;
    let breaker = state.breakers.get_or_create("generative_classifier", CircuitBreakerConfig::critical());
    for _ in 0..breaker.config().failure_threshold {
        let _ = breaker.call(|| async { Err::<(), _>("down") }).await;
    }
    let app = build_router(state);

    let (_, _, body) = send(&app, Request::builder().uri("/health").body(Body::empty()).unwrap()).await;

    assert_eq!(body["status"], "degraded");
    assert_eq!(body["circuits"][0]["name"], "generative_classifier");
    assert_eq!(body["circuits"][0]["state"], "open");
}

#[tokio::test]
async fn test_start_job_accepts_and_completes() {
    let state = test_state().await;
    let app = build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/jobs")
        .header(header::CONTENT_TYPE, "application/json")
        .header(CALLER_ID_HEADER, "editor-1")
        .body(Body::from(
            json!({ "kind": "dictionary-import", "source": { "inline": SMALL_DICTIONARY } }).to_string(),
        ))
        .unwrap();
    let (status, _, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["total_units"], 3);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let mut last = Value::Null;
    for _ in 0..100 {
        let (_, _, job) = send(
            &app,
            Request::builder().uri(format!("/jobs/{}", job_id)).body(Body::empty()).unwrap(),
        )
        .await;
        if job["status"] == "completed" {
            last = job;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(last["status"], "completed");
    assert_eq!(last["processed_count"], 3);
    assert_eq!(last["inserted_count"], 3);
}

#[tokio::test]
async fn test_start_job_with_empty_source_is_bad_request() {
    let app = build_router(test_state().await);

    let request = Request::builder()
        .method("POST")
        .uri("/jobs")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "kind": "dictionary-import", "source": { "inline": "   " } }).to_string(),
        ))
        .unwrap();
    let (status, _, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let app = build_router(test_state().await);

    let (status, _, _) = send(
        &app,
        Request::builder()
            .uri(format!("/jobs/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_requires_caller_identity() {
    let state = test_state().await;
    let job_id = staged_job(&state).await;
    let app = build_router(state.clone());

    let (status, _, body) = send(&app, cancel_request(job_id, None)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    let job = lexa_ingest::db::jobs::get(&state.db, job_id).await.unwrap();
    assert!(!job.cancel_requested);
}

#[tokio::test]
async fn test_cancel_is_idempotent_over_http() {
    let state = test_state().await;
    let job_id = staged_job(&state).await;
    let app = build_router(state);

    let (first_status, _, first) = send(&app, cancel_request(job_id, Some("editor-1"))).await;
    let (second_status, _, second) = send(&app, cancel_request(job_id, Some("editor-1"))).await;

    assert_eq!(first_status, StatusCode::OK);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(first["status"], "cancelled");
    assert_eq!(second["status"], "cancelled");
    assert_eq!(second["processed_count"], 0);
    assert_eq!(second["cancel_requested"], true);
}

#[tokio::test]
async fn test_eleventh_cancel_in_a_minute_is_rate_limited() {
    let state = test_state().await;
    let job_id = staged_job(&state).await;
    let app = build_router(state);

    for attempt in 0..10 {
        let (status, _, _) = send(&app, cancel_request(job_id, Some("editor-1"))).await;
        assert_eq!(status, StatusCode::OK, "attempt {}", attempt + 1);
    }

    let (status, headers, body) = send(&app, cancel_request(job_id, Some("editor-1"))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
    let retry_after: u64 = headers
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));

    // quotas are per caller
    let (other_status, _, _) = send(&app, cancel_request(job_id, Some("editor-2"))).await;
    assert_eq!(other_status, StatusCode::OK);
}

#[tokio::test]
async fn test_continue_on_terminal_job_is_not_accepted() {
    let state = test_state().await;
    let job_id = staged_job(&state).await;
    state.engine.cancel(job_id, None).await.unwrap();
    let app = build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri(format!("/jobs/{}/continue", job_id))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["accepted"], false);
    assert_eq!(body["status"], "cancelled");
}

#[tokio::test]
async fn test_list_jobs_returns_staged_jobs() {
    let state = test_state().await;
    let first = staged_job(&state).await;
    let second = staged_job(&state).await;
    let app = build_router(state);

    let (status, _, body) = send(&app, Request::builder().uri("/jobs?limit=10").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body.as_array().unwrap().iter().map(|j| j["id"].as_str().unwrap()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first.to_string().as_str()));
    assert!(ids.contains(&second.to_string().as_str()));
}
