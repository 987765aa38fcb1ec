//! Recovery of jobs orphaned by a crashed worker
//!
//! Runs once at startup and then periodically. Running jobs whose lease has
//! expired are rescheduled from their persisted cursor, `cancelling` jobs
//! are finalized, and jobs left `queued` by a crash between staging and
//! their first transition are started. Paused jobs wait for an explicit
//! continue trigger.

use std::time::Duration;

use chrono::Utc;
use lexa_common::jobs::JobStatus;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ChunkOutcome, ChunkedJobEngine, EngineError};
use crate::db::jobs;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs rescheduled from their cursor
    pub resumed: Vec<Uuid>,
    /// Cancelling jobs moved to cancelled
    pub finalized: Vec<Uuid>,
}

pub async fn recover_jobs(engine: &ChunkedJobEngine) -> Result<RecoveryReport, EngineError> {
    let mut report = RecoveryReport::default();

    for job in jobs::list_by_status(engine.db(), JobStatus::Cancelling).await? {
        match engine.process_chunk(job.id, None).await {
            Ok(ChunkOutcome::Cancelled { .. }) => report.finalized.push(job.id),
            Ok(other) => tracing::debug!(job_id = %job.id, outcome = ?other, "Cancelling job not finalized"),
            Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Failed to finalize cancelling job"),
        }
    }

    let now_ms = Utc::now().timestamp_millis();
    let mut orphaned = jobs::list_resumable(engine.db(), now_ms).await?;
    orphaned.extend(jobs::list_by_status(engine.db(), JobStatus::Queued).await?);

    for job in orphaned {
        tracing::info!(
            job_id = %job.id,
            status = %job.status,
            cursor = job.cursor,
            total_units = job.total_units,
            "Resuming orphaned job"
        );
        engine.schedule(job.id, job.cursor);
        report.resumed.push(job.id);
    }

    Ok(report)
}

/// Run [`recover_jobs`] every `interval` until `shutdown` fires
pub async fn run_recovery_sweeps(engine: ChunkedJobEngine, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick completes immediately; startup recovery already ran
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match recover_jobs(&engine).await {
                    Ok(report) if report.resumed.is_empty() && report.finalized.is_empty() => {}
                    Ok(report) => tracing::info!(
                        resumed = report.resumed.len(),
                        finalized = report.finalized.len(),
                        "Recovery sweep rescheduled jobs"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Recovery sweep failed"),
                }
            }
        }
    }
}
