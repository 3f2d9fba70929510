pub mod catalog;
pub mod events;
pub mod fallback;
pub mod manager;
pub mod progress;
pub mod supervisor;
pub mod ytdlp;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::downloader::catalog::QualityPreference;
use crate::downloader::fallback::{ErrorClassification, FallbackState};

pub use manager::DownloadQueue;
pub use supervisor::{ProcessHandle, SpawnRequest, Supervisor, SupervisorEvent, SupervisorEventKind};
pub use ytdlp::YtDlpSupervisor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub source_url: String,
    pub quality: QualityPreference,
    pub status: DownloadStatus,
    pub progress: f32,
    pub speed: Option<u64>, // bytes per second
    pub eta: Option<u64>,   // seconds
    pub error: Option<String>,
    pub error_kind: Option<ErrorClassification>,
    pub retryable: bool,
    pub fallback: FallbackState,
    pub output_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    /// FIFO position; refreshed whenever the job re-enters the queue.
    pub queued_seq: u64,
}

impl DownloadJob {
    pub fn new(id: String, source_url: String, quality: QualityPreference, queued_seq: u64) -> Self {
        Self {
            id,
            source_url,
            quality,
            status: DownloadStatus::Queued,
            progress: 0.0,
            speed: None,
            eta: None,
            error: None,
            error_kind: None,
            retryable: false,
            fallback: FallbackState::default(),
            output_path: None,
            file_size: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            queued_seq,
        }
    }

    pub fn progress_snapshot(&self) -> DownloadProgress {
        DownloadProgress {
            job_id: self.id.clone(),
            status: self.status.clone(),
            progress: self.progress,
            current_speed: self.speed,
            estimated_time_remaining: self.eta,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub job_id: String,
    pub status: DownloadStatus,
    pub progress: f32,
    pub current_speed: Option<u64>, // bytes per second
    pub estimated_time_remaining: Option<u64>, // seconds
}
