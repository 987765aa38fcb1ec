//! Event types and the in-process event bus
//!
//! Events are advisory: the job record in the database is the source of
//! truth, events only let UIs and monitors follow along without polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::jobs::{JobKind, JobStatus};

/// Lexa event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LexaEvent {
    /// A job was accepted and its units staged
    JobStarted {
        job_id: Uuid,
        kind: JobKind,
        total_units: u64,
        timestamp: DateTime<Utc>,
    },

    /// A job moved between statuses
    JobStatusChanged {
        job_id: Uuid,
        old_status: JobStatus,
        new_status: JobStatus,
        timestamp: DateTime<Utc>,
    },

    /// A chunk committed its records and checkpoint
    ChunkCommitted {
        job_id: Uuid,
        cursor: u64,
        total_units: u64,
        inserted: u64,
        unresolved: u64,
        timestamp: DateTime<Utc>,
    },

    /// A job reached a terminal status
    JobFinished {
        job_id: Uuid,
        status: JobStatus,
        processed_count: u64,
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A downstream dependency's circuit breaker changed state
    CircuitStateChanged {
        dependency: String,
        state: String,
        timestamp: DateTime<Utc>,
    },
}

impl LexaEvent {
    /// Event type name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            LexaEvent::JobStarted { .. } => "JobStarted",
            LexaEvent::JobStatusChanged { .. } => "JobStatusChanged",
            LexaEvent::ChunkCommitted { .. } => "ChunkCommitted",
            LexaEvent::JobFinished { .. } => "JobFinished",
            LexaEvent::CircuitStateChanged { .. } => "CircuitStateChanged",
        }
    }

    /// Job the event belongs to, if any
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            LexaEvent::JobStarted { job_id, .. }
            | LexaEvent::JobStatusChanged { job_id, .. }
            | LexaEvent::ChunkCommitted { job_id, .. }
            | LexaEvent::JobFinished { job_id, .. } => Some(*job_id),
            LexaEvent::CircuitStateChanged { .. } => None,
        }
    }
}

/// Broadcast event bus shared by the engine, the API and SSE clients
///
/// Slow subscribers lose the oldest events once `capacity` is exceeded.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LexaEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use lexa_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.capacity(), 100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<LexaEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: LexaEvent) -> Result<usize, broadcast::error::SendError<LexaEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: LexaEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
