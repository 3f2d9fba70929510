//! Process supervision contract.
//!
//! A [`Supervisor`] launches one extraction process per [`SpawnRequest`]
//! and reports back through a shared, ordered event channel. Every event
//! is stamped with the job id and the spawn generation so the queue can
//! drop events from spawns it has already superseded.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::downloader::catalog;
use crate::downloader::fallback::FallbackState;
use crate::downloader::progress::ProgressSample;
use crate::downloader::DownloadJob;
use crate::errors::{AppError, Result};

pub type EventSender = mpsc::UnboundedSender<SupervisorEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SupervisorEvent>;

/// Everything needed to launch the tool for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub job_id: String,
    pub generation: u64,
    pub source_url: String,
    pub format_expression: String,
    pub player_client: String,
    pub output_dir: PathBuf,
}

impl SpawnRequest {
    pub fn for_job(job: &DownloadJob, state: &FallbackState, generation: u64, output_dir: PathBuf) -> Self {
        Self {
            job_id: job.id.clone(),
            generation,
            source_url: job.source_url.clone(),
            format_expression: catalog::format_expression(state.format_strategy(), job.quality),
            player_client: state.player_client().to_string(),
            output_dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorEvent {
    pub job_id: String,
    pub generation: u64,
    pub kind: SupervisorEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEventKind {
    Progress(ProgressSample),
    Completed {
        path: PathBuf,
        size: u64,
    },
    Failed {
        /// Tail of the tool's diagnostics.
        message: String,
        /// Classification tag when the failure is unambiguous.
        error_type: Option<String>,
    },
}

impl SupervisorEventKind {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SupervisorEventKind::Progress(_))
    }
}

/// Stamps and sends events for a single spawn.
///
/// Dropping an emitter that never sent a terminal event reports a
/// failure, so a supervising task that panics or returns early still
/// frees the queue slot. After a cancel the slot has already moved on
/// and that failure is discarded as stale.
#[derive(Debug)]
pub struct EventEmitter {
    job_id: String,
    generation: u64,
    tx: EventSender,
    settled: AtomicBool,
}

impl EventEmitter {
    pub fn new(job_id: String, generation: u64, tx: EventSender) -> Self {
        Self {
            job_id,
            generation,
            tx,
            settled: AtomicBool::new(false),
        }
    }

    fn emit(&self, kind: SupervisorEventKind) {
        if kind.is_terminal() && self.settled.swap(true, Ordering::SeqCst) {
            log::debug!("Spawn {} of job {} already reported an outcome", self.generation, self.job_id);
            return;
        }
        let event = SupervisorEvent {
            job_id: self.job_id.clone(),
            generation: self.generation,
            kind,
        };
        if self.tx.send(event).is_err() {
            log::debug!("Event receiver for job {} is gone", self.job_id);
        }
    }

    pub fn progress(&self, sample: ProgressSample) {
        self.emit(SupervisorEventKind::Progress(sample));
    }

    pub fn completed(&self, path: PathBuf, size: u64) {
        self.emit(SupervisorEventKind::Completed { path, size });
    }

    pub fn failed(&self, message: impl Into<String>, error_type: Option<String>) {
        self.emit(SupervisorEventKind::Failed {
            message: message.into(),
            error_type,
        });
    }
}

impl Drop for EventEmitter {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            log::debug!(
                "Spawn {} of job {} ended without reporting an outcome",
                self.generation,
                self.job_id
            );
            self.failed("Supervisor task ended without reporting an outcome", None);
        }
    }
}

/// Handle to a running spawn.
///
/// Cancelling asks the supervising task to stop the process and resolves
/// once the task acknowledges. Cancelling a spawn that already exited is
/// a no-op.
#[derive(Debug)]
pub struct ProcessHandle {
    job_id: String,
    generation: u64,
    cancel_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    pub fn new(job_id: String, generation: u64, cancel_tx: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            job_id,
            generation,
            cancel_tx: Some(cancel_tx),
            task: Some(task),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    pub async fn cancel(&mut self) -> Result<()> {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            if cancel_tx.send(()).is_err() {
                log::debug!("Spawn {} of job {} already exited", self.generation, self.job_id);
            }
        }

        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| AppError::Process(format!("Supervisor task failed: {}", e)))?;
        }

        Ok(())
    }
}

#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Launches the tool. Failing to launch at all is reported as an
    /// error rather than an event.
    async fn spawn(&self, request: SpawnRequest, events: EventSender) -> Result<ProcessHandle>;
    fn get_name(&self) -> &str;
}
