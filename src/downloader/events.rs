//! Queue change notifications.
//!
//! [`Bus`] wraps a [`tokio::sync::broadcast`] channel. Publishing never
//! blocks; subscribers that fall behind observe `RecvError::Lagged(n)` and
//! skip the oldest `n` events. Events published while nobody listens are
//! dropped.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;

use crate::downloader::fallback::{ErrorClassification, FallbackState};
use crate::downloader::{DownloadProgress, DownloadStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    JobAdded {
        job_id: String,
        source_url: String,
    },
    StatusChanged {
        job_id: String,
        status: DownloadStatus,
    },
    Progress(DownloadProgress),
    /// A failed attempt moved the job to the next selection.
    FallbackAdvanced {
        job_id: String,
        classification: ErrorClassification,
        state: FallbackState,
        delay_ms: Option<u64>,
    },
    JobFailed {
        job_id: String,
        message: String,
        classification: ErrorClassification,
        retryable: bool,
    },
    JobCompleted {
        job_id: String,
        path: PathBuf,
        size: u64,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> &str {
        match self {
            QueueEvent::JobAdded { job_id, .. }
            | QueueEvent::StatusChanged { job_id, .. }
            | QueueEvent::FallbackAdvanced { job_id, .. }
            | QueueEvent::JobFailed { job_id, .. }
            | QueueEvent::JobCompleted { job_id, .. } => job_id,
            QueueEvent::Progress(progress) => &progress.job_id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<QueueEvent>,
}

impl Bus {
    /// Capacity is shared across receivers; minimum 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel::<QueueEvent>(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: QueueEvent) {
        let _ = self.tx.send(event);
    }

    /// Receives only events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }
}
