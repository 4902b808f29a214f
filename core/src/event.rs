//! Progress events emitted while sources are transferred and resolved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::digest::Digest;

/// Progress of one unit of work attached to a build vertex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexStatus {
    /// Progress stream id (e.g., "transferring context:")
    pub id: String,

    /// Vertex this progress belongs to, if known
    pub vertex: Option<Digest>,

    /// Action label (e.g., "transferring")
    pub action: String,

    /// Expected total, 0 when unknown
    pub total: u64,

    /// Running count (bytes for transfers)
    pub current: u64,

    /// When this status was produced
    pub timestamp: DateTime<Utc>,

    /// When the work started
    pub started: Option<DateTime<Utc>>,

    /// When the work finished
    pub completed: Option<DateTime<Utc>>,
}

impl VertexStatus {
    /// Create a started status with no progress yet.
    pub fn started(id: impl Into<String>, action: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            vertex: None,
            action: action.into(),
            total: 0,
            current: 0,
            timestamp: now,
            started: Some(now),
            completed: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }
}

/// Broadcasts progress to any number of subscribers.
///
/// Emitting with no subscribers is not an error; the status is dropped.
#[derive(Clone)]
pub struct ProgressEmitter {
    sender: Arc<broadcast::Sender<VertexStatus>>,
}

impl ProgressEmitter {
    /// Create a new emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit a status
    pub fn emit(&self, status: VertexStatus) {
        let _ = self.sender.send(status);
    }

    /// Subscribe to statuses
    pub fn subscribe(&self) -> broadcast::Receiver<VertexStatus> {
        self.sender.subscribe()
    }
}

impl Default for ProgressEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
