//! Event types for the hcat event system
//!
//! Ingest sessions and commit jobs broadcast their lifecycle through the
//! EventBus. Consumers (SSE streams, the CLI progress printer) subscribe and
//! filter; nothing in the pipeline depends on an event being received.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Ingest pipeline events
///
/// States and statuses travel as their lowercase wire labels so this crate
/// does not depend on the pipeline's model types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IngestEvent {
    /// Session moved between workflow states
    SessionStateChanged {
        session_id: Uuid,
        old_state: String,
        new_state: String,
        timestamp: DateTime<Utc>,
    },

    /// Commit job created and waiting for a worker
    JobQueued {
        job_id: Uuid,
        session_id: Uuid,
        total_rows: usize,
        timestamp: DateTime<Utc>,
    },

    /// Worker claimed the job (queued → running)
    JobStarted {
        job_id: Uuid,
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// One row attempted
    JobProgress {
        job_id: Uuid,
        processed: usize,
        total: usize,
        created_records: usize,
        created_assets: usize,
        error_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// Row-scoped commit failure (processing continues)
    RowFailed {
        job_id: Uuid,
        row_index: usize,
        stage: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Job reached a terminal status
    JobFinished {
        job_id: Uuid,
        session_id: Uuid,
        status: String,
        created_records: usize,
        created_assets: usize,
        error_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// Rollback pass over a job manifest finished
    JobRolledBack {
        job_id: Uuid,
        reverted_records: usize,
        failures: usize,
        timestamp: DateTime<Utc>,
    },
}

impl IngestEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            IngestEvent::SessionStateChanged { .. } => "SessionStateChanged",
            IngestEvent::JobQueued { .. } => "JobQueued",
            IngestEvent::JobStarted { .. } => "JobStarted",
            IngestEvent::JobProgress { .. } => "JobProgress",
            IngestEvent::RowFailed { .. } => "RowFailed",
            IngestEvent::JobFinished { .. } => "JobFinished",
            IngestEvent::JobRolledBack { .. } => "JobRolledBack",
        }
    }

    /// Job this event belongs to, if any
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            IngestEvent::SessionStateChanged { .. } => None,
            IngestEvent::JobQueued { job_id, .. }
            | IngestEvent::JobStarted { job_id, .. }
            | IngestEvent::JobProgress { job_id, .. }
            | IngestEvent::RowFailed { job_id, .. }
            | IngestEvent::JobFinished { job_id, .. }
            | IngestEvent::JobRolledBack { job_id, .. } => Some(*job_id),
        }
    }
}

/// Broadcast bus for ingest events
///
/// Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IngestEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new EventBus; `capacity` events are buffered before the
    /// oldest are dropped for slow subscribers.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: IngestEvent,
    ) -> Result<usize, broadcast::error::SendError<IngestEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: IngestEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
