//! Lifecycle events
//!
//! Emitted by the server core after a state change has been durably
//! written, and streamed to dashboards over SSE. Events are notifications
//! only: no component derives record state from them.

use crate::db::models::ResponseStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FsrEvent {
    /// Phase-1 submit resolved to a record
    ResponseSubmitted {
        response_id: String,
        survey_id: String,
        /// false when the submission matched an existing fingerprint
        created: bool,
        timestamp: DateTime<Utc>,
    },

    /// Status changed through the lifecycle gate
    StatusChanged {
        response_id: String,
        from: ResponseStatus,
        to: ResponseStatus,
        actor: String,
        cause: String,
        version: i64,
        timestamp: DateTime<Utc>,
    },

    /// Status change refused by the lifecycle gate
    TransitionRejected {
        response_id: String,
        from: ResponseStatus,
        to: ResponseStatus,
        actor: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Phase-2 audio stored and recorded on the response
    AudioAttached {
        response_id: String,
        file_size_bytes: u64,
        timestamp: DateTime<Utc>,
    },

    /// Record said "uploaded" but object storage does not have the bytes
    EvidenceMissing {
        response_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Client exhausted its phase-2 retry bound
    SyncStalled {
        response_id: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },

    QcBatchCreated {
        batch_id: String,
        survey_id: String,
        sampled: usize,
        remainder: usize,
        timestamp: DateTime<Utc>,
    },

    QcBatchApplied {
        batch_id: String,
        decision: String,
        decided: usize,
        skipped: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl FsrEvent {
    /// Event type name (SSE `event:` field)
    pub fn event_type(&self) -> &'static str {
        match self {
            FsrEvent::ResponseSubmitted { .. } => "ResponseSubmitted",
            FsrEvent::StatusChanged { .. } => "StatusChanged",
            FsrEvent::TransitionRejected { .. } => "TransitionRejected",
            FsrEvent::AudioAttached { .. } => "AudioAttached",
            FsrEvent::EvidenceMissing { .. } => "EvidenceMissing",
            FsrEvent::SyncStalled { .. } => "SyncStalled",
            FsrEvent::QcBatchCreated { .. } => "QcBatchCreated",
            FsrEvent::QcBatchApplied { .. } => "QcBatchApplied",
        }
    }
}

/// Broadcast bus for lifecycle events
///
/// Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FsrEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering `capacity` events per slow subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<FsrEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: FsrEvent) -> Result<usize, broadcast::error::SendError<FsrEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: FsrEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
