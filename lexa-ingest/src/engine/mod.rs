//! Chunked job engine
//!
//! A job's units are staged once, then processed in fixed-size chunks. Each
//! chunk writes its rows and advances the checkpoint in one transaction, so a
//! crash at any point leaves the job resumable from its persisted cursor.
//!
//! Per invocation of [`ChunkedJobEngine::process_chunk`]:
//!
//! 1. claim the job (in-process single-flight set, then the database lease)
//! 2. re-read the job; honour a pending cancellation before any work
//! 3. process one chunk and commit rows + checkpoint
//! 4. complete, pause (time budget spent) or continue, per [`ContinuationMode`]
//!
//! Failures inside a chunk mark the job `failed` with the causal message and
//! stop further scheduling.

pub mod processor;
pub mod queue;
pub mod recovery;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use lexa_common::config::{ContinuationMode, EngineConfig};
use lexa_common::events::{EventBus, LexaEvent};
use lexa_common::jobs::{JobKind, JobStatus};
use lexa_common::Error;
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{jobs, settings, units};
use crate::models::{Job, SourceReference};
use crate::utils::retry_on_lock;

pub use processor::{
    CorpusAnnotateProcessor, DictionaryImportProcessor, GenerativeDeps, PreparedChunk,
    StagedUnits, UnitProcessor, UnitWrite,
};
pub use queue::{run_worker, ChunkQueue, ChunkTask};
pub use recovery::{recover_jobs, run_recovery_sweeps, RecoveryReport};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] Error),

    #[error("Job {0} not found")]
    UnknownJob(Uuid),

    #[error("Illegal job transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("Chunk out of order for job {job_id}: requested {requested}, cursor is {cursor}")]
    OutOfOrder { job_id: Uuid, requested: u64, cursor: u64 },

    #[error("No processor registered for {0} jobs")]
    NoProcessor(JobKind),
}

impl EngineError {
    fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Store(Error::Conflict(_)))
    }
}

/// What one `process_chunk` invocation did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChunkOutcome {
    /// Another invocation holds the job
    Busy,
    /// The requested chunk was already committed
    Stale { cursor: u64 },
    /// The job was already terminal
    Finished { status: JobStatus },
    /// Chunk committed, next chunk handed to the continuation
    Continued { cursor: u64 },
    /// Time budget spent; resumable from `cursor`
    Paused { cursor: u64 },
    Completed { processed_count: u64 },
    Cancelled { processed_count: u64 },
    Failed { message: String },
}

/// Removes the job from the in-flight set when the invocation ends
struct InFlight {
    set: Arc<Mutex<HashSet<Uuid>>>,
    job_id: Uuid,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

#[derive(Clone)]
pub struct ChunkedJobEngine {
    db: SqlitePool,
    event_bus: EventBus,
    config: EngineConfig,
    processors: Arc<HashMap<JobKind, Arc<dyn UnitProcessor>>>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    worker_id: Arc<str>,
    queue: Option<ChunkQueue>,
    last_error: Arc<RwLock<Option<String>>>,
}

impl ChunkedJobEngine {
    pub fn new(db: SqlitePool, event_bus: EventBus, config: EngineConfig) -> Self {
        Self {
            db,
            event_bus,
            config,
            processors: Arc::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            worker_id: Arc::from(format!("lexa-ingest-{}", Uuid::new_v4())),
            queue: None,
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_processor(mut self, processor: Arc<dyn UnitProcessor>) -> Self {
        Arc::make_mut(&mut self.processors).insert(processor.kind(), processor);
        self
    }

    /// Continue through a work queue instead of spawning a driver per job
    pub fn with_queue(mut self, queue: ChunkQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Message of the most recent chunk failure
    pub fn last_error(&self) -> Arc<RwLock<Option<String>>> {
        self.last_error.clone()
    }

    fn processor(&self, kind: JobKind) -> Result<Arc<dyn UnitProcessor>, EngineError> {
        self.processors
            .get(&kind)
            .cloned()
            .ok_or(EngineError::NoProcessor(kind))
    }

    /// Validate the source, stage its units and mark the job running
    ///
    /// Does not process anything; see [`start_job`](Self::start_job).
    pub async fn create_job(&self, kind: JobKind, source: SourceReference) -> Result<Job, EngineError> {
        source.validate()?;
        let processor = self.processor(kind)?;

        let staged = {
            let source = source.clone();
            tokio::task::spawn_blocking(move || processor.stage(&source))
                .await
                .map_err(|e| Error::Internal(format!("Staging task failed: {}", e)))??
        };

        let mut job = Job::new(kind, source, staged.units.len() as u64);
        job.metadata = staged.metadata;

        let max_wait_ms = settings::max_lock_wait_ms(&self.db).await?;
        let db = &self.db;
        let job_ref = &job;
        let staged_units = staged.units.as_slice();
        retry_on_lock("job staging", max_wait_ms, || async move {
            let mut tx = db.begin().await?;
            jobs::insert(&mut tx, job_ref).await?;
            units::stage(&mut tx, job_ref.id, 0, staged_units).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        info!(
            job_id = %job.id,
            kind = %kind,
            total_units = job.total_units,
            rejected = job.metadata.rejected_entries,
            source = %job.source.describe(),
            "Job staged"
        );
        self.event_bus.emit_lossy(LexaEvent::JobStarted {
            job_id: job.id,
            kind,
            total_units: job.total_units,
            timestamp: Utc::now(),
        });

        self.transition(job.id, JobStatus::Queued, JobStatus::Running, None)
            .await?;
        Ok(jobs::get(&self.db, job.id).await?)
    }

    /// Create a job and begin processing chunk 0 in the background
    pub async fn start_job(&self, kind: JobKind, source: SourceReference) -> Result<Job, EngineError> {
        let job = self.create_job(kind, source).await?;
        self.schedule(job.id, 0);
        Ok(job)
    }

    /// Trigger processing of a non-terminal job from `from_index` (default: its cursor)
    pub async fn continue_job(&self, job_id: Uuid, from_index: Option<u64>) -> Result<Job, EngineError> {
        let job = jobs::load(&self.db, job_id)
            .await?
            .ok_or(EngineError::UnknownJob(job_id))?;
        if !job.status.is_terminal() {
            self.schedule(job_id, from_index.unwrap_or(job.cursor));
        }
        Ok(job)
    }

    /// Hand the chunk at `from_index` to the continuation
    pub fn schedule(&self, job_id: Uuid, from_index: u64) {
        match &self.queue {
            Some(queue) => queue.enqueue(ChunkTask { job_id, from_index }),
            None => {
                let engine = self.clone();
                tokio::spawn(async move { engine.drive(job_id, from_index).await });
            }
        }
    }

    /// Run invocations back to back while they report `Continued`
    async fn drive(&self, job_id: Uuid, mut from_index: u64) {
        loop {
            match self.process_chunk(job_id, Some(from_index)).await {
                Ok(ChunkOutcome::Continued { cursor }) => from_index = cursor,
                Ok(outcome) => {
                    debug!(job_id = %job_id, outcome = ?outcome, "Job driver finished");
                    return;
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Job driver stopped");
                    return;
                }
            }
        }
    }

    /// Request cooperative cancellation
    ///
    /// Idempotent. A job with no chunk in flight is finalized right away;
    /// otherwise the running invocation finalizes it at its next chunk
    /// boundary.
    pub async fn cancel(&self, job_id: Uuid, reason: Option<&str>) -> Result<Job, EngineError> {
        let before = jobs::load(&self.db, job_id)
            .await?
            .ok_or(EngineError::UnknownJob(job_id))?;
        let job = jobs::request_cancel(&self.db, job_id, reason).await?;

        if before.status != job.status {
            self.emit_status(job_id, before.status, job.status);
        }
        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "Cancel on terminal job ignored");
            return Ok(job);
        }

        info!(job_id = %job_id, reason = ?reason, "Cancellation requested");
        let outcome = self.process_chunk(job_id, None).await?;
        debug!(job_id = %job_id, outcome = ?outcome, "Cancellation checkpoint");

        Ok(jobs::get(&self.db, job_id).await?)
    }

    /// Process chunks of `job_id`, starting at `from_index` when given
    ///
    /// `from_index` below the persisted cursor is a replay of a committed
    /// chunk and does nothing ([`ChunkOutcome::Stale`]); above it is an
    /// ordering error.
    pub async fn process_chunk(&self, job_id: Uuid, from_index: Option<u64>) -> Result<ChunkOutcome, EngineError> {
        let Some(_claim) = self.claim(job_id) else {
            debug!(job_id = %job_id, "Job already in flight in this worker");
            return Ok(ChunkOutcome::Busy);
        };

        if !jobs::acquire_lease(&self.db, job_id, &self.worker_id, self.config.lease_ttl_ms).await? {
            debug!(job_id = %job_id, "Job leased by another worker");
            return Ok(ChunkOutcome::Busy);
        }

        let outcome = self.run_invocation(job_id, from_index).await;

        if let Err(e) = jobs::release_lease(&self.db, job_id, &self.worker_id).await {
            warn!(job_id = %job_id, error = %e, "Failed to release job lease");
        }

        outcome
    }

    fn claim(&self, job_id: Uuid) -> Option<InFlight> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        set.insert(job_id).then(|| InFlight {
            set: self.in_flight.clone(),
            job_id,
        })
    }

    async fn run_invocation(&self, job_id: Uuid, from_index: Option<u64>) -> Result<ChunkOutcome, EngineError> {
        let started = Instant::now();
        let budget = Duration::from_millis(self.config.time_budget_ms);
        let mut expected = from_index;

        loop {
            let job = jobs::load(&self.db, job_id)
                .await?
                .ok_or(EngineError::UnknownJob(job_id))?;

            if job.status.is_terminal() {
                return Ok(ChunkOutcome::Finished { status: job.status });
            }

            if job.cancel_requested || job.status == JobStatus::Cancelling {
                return self.finalize_cancel(&job).await;
            }

            if let Some(requested) = expected.take() {
                if requested < job.cursor {
                    debug!(job_id = %job_id, requested, cursor = job.cursor, "Chunk already committed");
                    return Ok(ChunkOutcome::Stale { cursor: job.cursor });
                }
                if requested > job.cursor {
                    return Err(EngineError::OutOfOrder {
                        job_id,
                        requested,
                        cursor: job.cursor,
                    });
                }
            }

            if matches!(job.status, JobStatus::Queued | JobStatus::Paused)
                && !self.try_transition(job_id, job.status, JobStatus::Running, None).await?
            {
                continue;
            }

            if job.is_exhausted() {
                if self
                    .try_transition(job_id, JobStatus::Running, JobStatus::Completed, None)
                    .await?
                {
                    let job = self.finish(job_id).await?;
                    return Ok(ChunkOutcome::Completed {
                        processed_count: job.processed_count,
                    });
                }
                continue;
            }

            if !jobs::acquire_lease(&self.db, job_id, &self.worker_id, self.config.lease_ttl_ms).await? {
                warn!(job_id = %job_id, "Job lease lost to another worker");
                return Ok(ChunkOutcome::Busy);
            }

            let cursor = match self.run_chunk(&job).await {
                Ok(cursor) => cursor,
                Err(e) if e.is_conflict() => {
                    warn!(job_id = %job_id, cursor = job.cursor, "Checkpoint lost to a concurrent writer");
                    return Ok(ChunkOutcome::Stale { cursor: job.cursor });
                }
                Err(e) => return self.fail(job_id, e.to_string()).await,
            };

            if cursor >= job.total_units {
                // completion is decided on the next pass, after the cancellation check
                continue;
            }

            if self.config.continuation == ContinuationMode::Queue {
                if let Some(queue) = &self.queue {
                    queue.enqueue(ChunkTask {
                        job_id,
                        from_index: cursor,
                    });
                }
                return Ok(ChunkOutcome::Continued { cursor });
            }

            if started.elapsed() >= budget {
                if self
                    .try_transition(job_id, JobStatus::Running, JobStatus::Paused, None)
                    .await?
                {
                    info!(
                        job_id = %job_id,
                        cursor,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Time budget spent, job paused"
                    );
                    return Ok(ChunkOutcome::Paused { cursor });
                }
                // status moved under us (cancellation); re-read
            }
        }
    }

    /// Process the chunk at the job's cursor; returns the new cursor
    async fn run_chunk(&self, job: &Job) -> Result<u64, EngineError> {
        let chunk_started = Instant::now();
        let units = units::load_range(&self.db, job.id, job.cursor, self.config.chunk_size).await?;
        if units.is_empty() {
            return Err(Error::Internal(format!(
                "Staged units end at {} of {}",
                job.cursor, job.total_units
            ))
            .into());
        }

        let prepared = self.processor(job.kind)?.prepare(&self.db, &units).await?;

        let max_wait_ms = settings::max_lock_wait_ms(&self.db).await?;
        let db = &self.db;
        let prepared = &prepared;
        let (cursor, tally) = retry_on_lock("chunk commit", max_wait_ms, || async move {
            let mut tx = db.begin().await?;
            let tally = prepared.commit(&mut tx, job.id).await?;
            let mut metadata = job.metadata.clone();
            metadata.absorb(&tally);
            let cursor = jobs::checkpoint(&mut tx, job.id, job.cursor, &tally, &metadata).await?;
            tx.commit().await?;
            Ok((cursor, tally))
        })
        .await?;

        info!(
            job_id = %job.id,
            from = job.cursor,
            cursor,
            total_units = job.total_units,
            inserted = tally.inserted,
            unresolved = tally.unresolved,
            errors = tally.errors,
            elapsed_ms = chunk_started.elapsed().as_millis() as u64,
            "Chunk committed"
        );
        self.event_bus.emit_lossy(LexaEvent::ChunkCommitted {
            job_id: job.id,
            cursor,
            total_units: job.total_units,
            inserted: tally.inserted,
            unresolved: tally.unresolved,
            timestamp: Utc::now(),
        });

        Ok(cursor)
    }

    async fn finalize_cancel(&self, job: &Job) -> Result<ChunkOutcome, EngineError> {
        let message = job.cancel_reason.as_deref().unwrap_or("Cancelled by request");
        let mut status = job.status;

        if matches!(status, JobStatus::Queued | JobStatus::Paused) {
            self.transition(job.id, status, JobStatus::Running, None).await?;
            status = JobStatus::Running;
        }
        let mut cancelled = false;
        if status == JobStatus::Running {
            cancelled = self
                .try_transition(job.id, JobStatus::Running, JobStatus::Cancelled, Some(message))
                .await?;
        }
        if !cancelled {
            // running -> cancelling raced with us, or it was cancelling already
            self.transition(job.id, JobStatus::Cancelling, JobStatus::Cancelled, Some(message))
                .await?;
        }

        let job = self.finish(job.id).await?;
        info!(job_id = %job.id, processed_count = job.processed_count, "Job cancelled");
        Ok(ChunkOutcome::Cancelled {
            processed_count: job.processed_count,
        })
    }

    async fn fail(&self, job_id: Uuid, message: String) -> Result<ChunkOutcome, EngineError> {
        error!(job_id = %job_id, error = %message, "Chunk failed, marking job failed");
        *self.last_error.write().await = Some(format!("Job {}: {}", job_id, message));

        let job = jobs::get(&self.db, job_id).await?;
        match job.status {
            JobStatus::Running => {
                self.transition(job_id, JobStatus::Running, JobStatus::Failed, Some(&message))
                    .await?
            }
            // cancellation overrides
            JobStatus::Cancelling => {
                self.transition(job_id, JobStatus::Cancelling, JobStatus::Cancelled, Some(&message))
                    .await?
            }
            other => {
                return Err(EngineError::IllegalTransition {
                    from: other,
                    to: JobStatus::Failed,
                })
            }
        }

        self.finish(job_id).await?;
        Ok(ChunkOutcome::Failed { message })
    }

    /// Release temporary storage of a terminal job and announce it
    async fn finish(&self, job_id: Uuid) -> Result<Job, EngineError> {
        match units::release(&self.db, job_id).await {
            Ok(released) => debug!(job_id = %job_id, released, "Staged units released"),
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to release staged units"),
        }

        let job = jobs::get(&self.db, job_id).await?;
        self.event_bus.emit_lossy(LexaEvent::JobFinished {
            job_id,
            status: job.status,
            processed_count: job.processed_count,
            message: job.message.clone(),
            timestamp: Utc::now(),
        });
        Ok(job)
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        message: Option<&str>,
    ) -> Result<(), EngineError> {
        if !from.can_transition_to(to) {
            return Err(EngineError::IllegalTransition { from, to });
        }
        jobs::transition(&self.db, job_id, from, to, message).await?;
        self.emit_status(job_id, from, to);
        Ok(())
    }

    /// Like `transition`, but a lost compare-and-set is `Ok(false)`
    async fn try_transition(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        message: Option<&str>,
    ) -> Result<bool, EngineError> {
        match self.transition(job_id, from, to, message).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn emit_status(&self, job_id: Uuid, old_status: JobStatus, new_status: JobStatus) {
        self.event_bus.emit_lossy(LexaEvent::JobStatusChanged {
            job_id,
            old_status,
            new_status,
            timestamp: Utc::now(),
        });
    }
}
