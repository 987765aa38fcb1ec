//! Chunk work queue
//!
//! Continuation as data: a committed chunk enqueues a [`ChunkTask`] for the
//! next one instead of calling back into the engine. The worker loop turns
//! each task into a fresh `process_chunk` invocation.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::ChunkedJobEngine;

/// Request to process the chunk of `job_id` starting at `from_index`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTask {
    pub job_id: Uuid,
    pub from_index: u64,
}

/// Sending half of the bounded chunk queue
#[derive(Debug, Clone)]
pub struct ChunkQueue {
    tx: mpsc::Sender<ChunkTask>,
}

impl ChunkQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<ChunkTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without blocking the caller
    ///
    /// A full queue applies backpressure to a detached sender task, never to
    /// the chunk that produced the task (that chunk may be running on the
    /// worker that drains the queue).
    pub fn enqueue(&self, task: ChunkTask) {
        match self.tx.try_send(task) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                tracing::warn!(job_id = %task.job_id, from_index = task.from_index, "Chunk queue full, deferring task");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if tx.send(task).await.is_err() {
                        tracing::warn!(job_id = %task.job_id, "Chunk queue closed, task dropped");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                tracing::warn!(job_id = %task.job_id, "Chunk queue closed, task dropped");
            }
        }
    }
}

/// Drain the queue until it closes or `shutdown` fires
///
/// Each task runs on its own tokio task, so independent jobs progress
/// concurrently. Chunks of one job stay ordered: the next task of a job is
/// only enqueued after its current chunk committed.
pub async fn run_worker(
    engine: ChunkedJobEngine,
    mut rx: mpsc::Receiver<ChunkTask>,
    shutdown: CancellationToken,
) {
    tracing::info!("Chunk worker started");

    loop {
        let task = tokio::select! {
            _ = shutdown.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        let engine = engine.clone();
        tokio::spawn(async move {
            match engine.process_chunk(task.job_id, Some(task.from_index)).await {
                Ok(outcome) => tracing::debug!(
                    job_id = %task.job_id,
                    from_index = task.from_index,
                    outcome = ?outcome,
                    "Chunk task finished"
                ),
                Err(e) => tracing::error!(
                    job_id = %task.job_id,
                    from_index = task.from_index,
                    error = %e,
                    "Chunk task failed"
                ),
            }
        });
    }

    tracing::info!("Chunk worker stopped");
}
