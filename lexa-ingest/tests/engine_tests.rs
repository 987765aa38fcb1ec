//! Chunked job engine integration tests
//!
//! Drive `process_chunk` directly against an in-memory database so every
//! invocation boundary is observable.

use std::sync::Arc;
use std::time::Duration;

use lexa_common::config::{ContinuationMode, EngineConfig};
use lexa_common::db::init_memory_database;
use lexa_common::events::{EventBus, LexaEvent};
use lexa_common::jobs::{JobKind, JobStatus};
use lexa_ingest::db::{entries, jobs, units};
use async_trait::async_trait;
use lexa_ingest::engine::{
    recover_jobs, ChunkOutcome, ChunkedJobEngine, DictionaryImportProcessor, EngineError, PreparedChunk,
    StagedUnits, UnitProcessor,
};
use lexa_ingest::models::{SourceReference, Unit};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Stages like a dictionary import, fails every chunk
struct BrokenProcessor;

#[async_trait]
impl UnitProcessor for BrokenProcessor {
    fn kind(&self) -> JobKind {
        JobKind::DictionaryImport
    }

    fn stage(&self, source: &SourceReference) -> lexa_common::Result<StagedUnits> {
        DictionaryImportProcessor.stage(source)
    }

    async fn prepare(&self, _db: &SqlitePool, _units: &[Unit]) -> lexa_common::Result<PreparedChunk> {
        Err(lexa_common::Error::Internal("boom".to_string()))
    }
}

/// `count` dictionary entries, each with a one-line body
fn dictionary(count: usize) -> SourceReference {
    let mut text = String::with_capacity(count * 32);
    for n in 0..count {
        text.push_str(&format!("*w{n}*,\nBody text {n}.\n\n"));
    }
    SourceReference::Inline(text)
}

fn engine_config(continuation: ContinuationMode, time_budget_ms: u64) -> EngineConfig {
    EngineConfig {
        chunk_size: 5000,
        time_budget_ms,
        continuation,
        ..EngineConfig::default()
    }
}

async fn test_engine(config: EngineConfig) -> ChunkedJobEngine {
    let db = init_memory_database().await.unwrap();
    ChunkedJobEngine::new(db, EventBus::new(1024), config).with_processor(Arc::new(DictionaryImportProcessor))
}

async fn wait_for_terminal(engine: &ChunkedJobEngine, job_id: Uuid) -> JobStatus {
    for _ in 0..200 {
        let job = jobs::get(engine.db(), job_id).await.unwrap();
        if job.status.is_terminal() {
            return job.status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {} did not finish", job_id);
}

#[tokio::test]
async fn test_ten_thousand_units_complete_in_two_invocations() {
    let engine = test_engine(engine_config(ContinuationMode::Queue, 50_000)).await;
    let job = engine.create_job(JobKind::DictionaryImport, dictionary(10_000)).await.unwrap();
    assert_eq!(job.total_units, 10_000);
    assert_eq!(job.status, JobStatus::Running);

    let first = engine.process_chunk(job.id, Some(0)).await.unwrap();
    assert_eq!(first, ChunkOutcome::Continued { cursor: 5000 });

    let mid = jobs::get(engine.db(), job.id).await.unwrap();
    assert_eq!(mid.processed_count, 5000);
    assert_eq!(mid.cursor, 5000);
    assert_eq!(mid.status, JobStatus::Running);

    let second = engine.process_chunk(job.id, Some(5000)).await.unwrap();
    assert_eq!(second, ChunkOutcome::Completed { processed_count: 10_000 });

    let done = jobs::get(engine.db(), job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.inserted_count, 10_000);
    assert!(done.finished_at.is_some());
    assert_eq!(entries::count(engine.db()).await.unwrap(), 10_000);
    assert_eq!(units::count(engine.db(), job.id).await.unwrap(), 0, "staged units released");
}

#[tokio::test]
async fn test_cancel_after_first_chunk_keeps_committed_work() {
    let engine = test_engine(engine_config(ContinuationMode::Queue, 50_000)).await;
    let job = engine.create_job(JobKind::DictionaryImport, dictionary(10_000)).await.unwrap();

    engine.process_chunk(job.id, Some(0)).await.unwrap();
    let cancelled = engine.cancel(job.id, Some("operator request")).await.unwrap();

    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.processed_count, 5000);
    assert!(cancelled.cancel_requested);
    assert_eq!(cancelled.message.as_deref(), Some("operator request"));
    assert_eq!(entries::count(engine.db()).await.unwrap(), 5000);

    // the continuation that was already handed off finds a terminal job
    let late = engine.process_chunk(job.id, Some(5000)).await.unwrap();
    assert_eq!(late, ChunkOutcome::Finished { status: JobStatus::Cancelled });
    assert_eq!(entries::count(engine.db()).await.unwrap(), 5000);
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let engine = test_engine(engine_config(ContinuationMode::Queue, 50_000)).await;
    let job = engine.create_job(JobKind::DictionaryImport, dictionary(20)).await.unwrap();

    let first = engine.cancel(job.id, Some("first")).await.unwrap();
    let second = engine.cancel(job.id, Some("second")).await.unwrap();

    assert_eq!(first.status, JobStatus::Cancelled);
    assert_eq!(second.status, JobStatus::Cancelled);
    assert_eq!(second.processed_count, 0);
    assert_eq!(second.cancel_reason.as_deref(), Some("first"));
}

#[tokio::test]
async fn test_cancel_of_completed_job_reports_completed() {
    let engine = test_engine(engine_config(ContinuationMode::Loop, 50_000)).await;
    let job = engine.create_job(JobKind::DictionaryImport, dictionary(20)).await.unwrap();
    engine.process_chunk(job.id, None).await.unwrap();

    let after = engine.cancel(job.id, None).await.unwrap();
    assert_eq!(after.status, JobStatus::Completed);
    assert_eq!(after.processed_count, 20);
}

#[tokio::test]
async fn test_replayed_chunk_is_stale_and_writes_nothing() {
    let engine = test_engine(engine_config(ContinuationMode::Queue, 50_000)).await;
    let job = engine.create_job(JobKind::DictionaryImport, dictionary(10_000)).await.unwrap();

    engine.process_chunk(job.id, Some(0)).await.unwrap();
    let rows = entries::count(engine.db()).await.unwrap();

    let replay = engine.process_chunk(job.id, Some(0)).await.unwrap();
    assert_eq!(replay, ChunkOutcome::Stale { cursor: 5000 });
    assert_eq!(entries::count(engine.db()).await.unwrap(), rows);

    let after = jobs::get(engine.db(), job.id).await.unwrap();
    assert_eq!(after.processed_count, 5000);
    assert_eq!(after.inserted_count, 5000);
}

#[tokio::test]
async fn test_chunk_ahead_of_cursor_is_rejected() {
    let engine = test_engine(engine_config(ContinuationMode::Queue, 50_000)).await;
    let job = engine.create_job(JobKind::DictionaryImport, dictionary(10_000)).await.unwrap();

    let err = engine.process_chunk(job.id, Some(5000)).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::OutOfOrder {
            requested: 5000,
            cursor: 0,
            ..
        }
    ));
    assert_eq!(jobs::get(engine.db(), job.id).await.unwrap().processed_count, 0);
}

#[tokio::test]
async fn test_progress_events_are_monotonic() {
    let engine = test_engine(EngineConfig {
        chunk_size: 1000,
        ..engine_config(ContinuationMode::Loop, 50_000)
    })
    .await;
    let mut rx = engine.event_bus().subscribe();
    let job = engine.create_job(JobKind::DictionaryImport, dictionary(4500)).await.unwrap();

    let outcome = engine.process_chunk(job.id, None).await.unwrap();
    assert_eq!(outcome, ChunkOutcome::Completed { processed_count: 4500 });

    let mut cursors = Vec::new();
    let mut finished = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            LexaEvent::ChunkCommitted { cursor, .. } => cursors.push(cursor),
            LexaEvent::JobFinished { status, .. } => finished = Some(status),
            _ => {}
        }
    }
    assert_eq!(cursors, vec![1000, 2000, 3000, 4000, 4500]);
    assert_eq!(finished, Some(JobStatus::Completed));
}

#[tokio::test]
async fn test_spent_budget_pauses_and_continue_resumes() {
    let engine = test_engine(engine_config(ContinuationMode::Loop, 0)).await;
    let job = engine.create_job(JobKind::DictionaryImport, dictionary(10_000)).await.unwrap();

    let first = engine.process_chunk(job.id, None).await.unwrap();
    assert_eq!(first, ChunkOutcome::Paused { cursor: 5000 });
    assert_eq!(jobs::get(engine.db(), job.id).await.unwrap().status, JobStatus::Paused);

    let second = engine.process_chunk(job.id, Some(5000)).await.unwrap();
    assert_eq!(second, ChunkOutcome::Completed { processed_count: 10_000 });
    assert_eq!(entries::count(engine.db()).await.unwrap(), 10_000);
}

#[tokio::test]
async fn test_cancel_of_paused_job_finalizes_immediately() {
    let engine = test_engine(engine_config(ContinuationMode::Loop, 0)).await;
    let job = engine.create_job(JobKind::DictionaryImport, dictionary(10_000)).await.unwrap();
    engine.process_chunk(job.id, None).await.unwrap();

    let cancelled = engine.cancel(job.id, None).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.processed_count, 5000);
}

#[tokio::test]
async fn test_recovery_resumes_orphaned_running_job() {
    let engine = test_engine(engine_config(ContinuationMode::Loop, 50_000)).await;
    let job = engine.create_job(JobKind::DictionaryImport, dictionary(6000)).await.unwrap();

    let report = recover_jobs(&engine).await.unwrap();
    assert_eq!(report.resumed, vec![job.id]);
    assert!(report.finalized.is_empty());

    assert_eq!(wait_for_terminal(&engine, job.id).await, JobStatus::Completed);
    assert_eq!(entries::count(engine.db()).await.unwrap(), 6000);
}

#[tokio::test]
async fn test_recovery_finalizes_cancelling_job() {
    let engine = test_engine(engine_config(ContinuationMode::Queue, 50_000)).await;
    let job = engine.create_job(JobKind::DictionaryImport, dictionary(10_000)).await.unwrap();
    engine.process_chunk(job.id, Some(0)).await.unwrap();

    // crash between the cancel request and its finalization
    let pending = jobs::request_cancel(engine.db(), job.id, Some("shutdown")).await.unwrap();
    assert_eq!(pending.status, JobStatus::Cancelling);

    let report = recover_jobs(&engine).await.unwrap();
    assert_eq!(report.finalized, vec![job.id]);
    assert!(report.resumed.is_empty());

    let after = jobs::get(engine.db(), job.id).await.unwrap();
    assert_eq!(after.status, JobStatus::Cancelled);
    assert_eq!(after.processed_count, 5000);
}

#[tokio::test]
async fn test_unreadable_source_is_rejected_before_staging() {
    let engine = test_engine(EngineConfig::default()).await;
    let err = engine
        .create_job(
            JobKind::DictionaryImport,
            SourceReference::Path("/nonexistent/lexa/dump.txt".into()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Store(lexa_common::Error::InvalidInput(_))));
    assert!(jobs::list(engine.db(), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_kind_without_processor_is_rejected() {
    let engine = test_engine(EngineConfig::default()).await;
    let err = engine
        .create_job(JobKind::CorpusAnnotate, SourceReference::Inline("# Song\nsome words\n".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoProcessor(JobKind::CorpusAnnotate)));
}

#[tokio::test]
async fn test_failing_chunk_marks_job_failed() {
    let db = init_memory_database().await.unwrap();
    let engine = ChunkedJobEngine::new(db, EventBus::new(64), engine_config(ContinuationMode::Loop, 50_000))
        .with_processor(Arc::new(BrokenProcessor));
    let job = engine.create_job(JobKind::DictionaryImport, dictionary(20)).await.unwrap();

    let outcome = engine.process_chunk(job.id, None).await.unwrap();
    assert_eq!(
        outcome,
        ChunkOutcome::Failed {
            message: "Internal error: boom".to_string()
        }
    );

    let failed = jobs::get(engine.db(), job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.message.as_deref(), Some("Internal error: boom"));
    assert_eq!(failed.processed_count, 0);
    assert!(failed.finished_at.is_some());
    assert_eq!(entries::count(engine.db()).await.unwrap(), 0);

    let again = engine.process_chunk(job.id, None).await.unwrap();
    assert_eq!(again, ChunkOutcome::Finished { status: JobStatus::Failed });
}

#[tokio::test]
async fn test_replayed_chunk_on_cancelling_job_finalizes_it() {
    let engine = test_engine(engine_config(ContinuationMode::Queue, 50_000)).await;
    let job = engine.create_job(JobKind::DictionaryImport, dictionary(10_000)).await.unwrap();
    engine.process_chunk(job.id, Some(0)).await.unwrap();
    jobs::request_cancel(engine.db(), job.id, Some("operator request")).await.unwrap();

    let replay = engine.process_chunk(job.id, Some(0)).await.unwrap();
    assert_eq!(replay, ChunkOutcome::Cancelled { processed_count: 5000 });
    assert_eq!(jobs::get(engine.db(), job.id).await.unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_recovery_continues_past_a_job_it_cannot_finalize() {
    let engine = test_engine(engine_config(ContinuationMode::Queue, 50_000)).await;
    let stuck = engine.create_job(JobKind::DictionaryImport, dictionary(20)).await.unwrap();
    let other = engine.create_job(JobKind::DictionaryImport, dictionary(20)).await.unwrap();
    jobs::request_cancel(engine.db(), stuck.id, None).await.unwrap();
    jobs::request_cancel(engine.db(), other.id, None).await.unwrap();

    sqlx::query(&format!(
        "CREATE TRIGGER reject_status BEFORE UPDATE OF status ON jobs WHEN OLD.id = '{}' \
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
        stuck.id
    ))
    .execute(engine.db())
    .await
    .unwrap();

    let report = recover_jobs(&engine).await.unwrap();
    assert_eq!(report.finalized, vec![other.id]);
    assert_eq!(jobs::get(engine.db(), stuck.id).await.unwrap().status, JobStatus::Cancelling);
    assert_eq!(jobs::get(engine.db(), other.id).await.unwrap().status, JobStatus::Cancelled);
}
