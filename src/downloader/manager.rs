//! Single-slot download queue.
//!
//! All job state lives behind one mutex. Supervisor events and delayed
//! respawns arrive on channels consumed by a single coordinator task, so
//! they are applied in order. Each spawn gets a fresh generation number;
//! events or timers carrying an older generation are dropped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::downloader::catalog::QualityPreference;
use crate::downloader::events::{Bus, QueueEvent};
use crate::downloader::fallback::{self, ErrorClassification, FallbackState, RetryPolicy};
use crate::downloader::supervisor::{
    EventReceiver, EventSender, ProcessHandle, SpawnRequest, Supervisor, SupervisorEvent,
    SupervisorEventKind,
};
use crate::downloader::{DownloadJob, DownloadStatus};
use crate::errors::{AppError, Result};
use crate::metadata::{MetadataRecord, MetadataStore};
use crate::security::InputValidator;
use crate::utils::generate_download_id;

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub output_dir: PathBuf,
    pub default_quality: QualityPreference,
    pub retry: RetryPolicy,
    pub event_capacity: usize,
}

impl QueueOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            output_dir: config.download_path.clone(),
            default_quality: config.preferred_quality,
            retry: config.retry.policy(),
            event_capacity: config.event_capacity,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddOutcome {
    pub job_ids: Vec<String>,
    /// URLs skipped because a live job already covers them.
    pub duplicates: Vec<String>,
    pub rejected: Vec<RejectedUrl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedUrl {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queued: Vec<DownloadJob>,
    pub downloading: Vec<DownloadJob>,
    pub paused: Vec<DownloadJob>,
    pub failed: Vec<DownloadJob>,
    pub completed: Vec<DownloadJob>,
    pub cancelled: Vec<DownloadJob>,
    pub stats: QueueStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub downloading: usize,
    pub paused: usize,
    pub failed: usize,
    pub completed: usize,
    pub cancelled: usize,
    /// Mean progress over every job in the collection.
    pub average_progress: f32,
}

#[derive(Debug)]
enum Slot {
    Idle,
    Running {
        job_id: String,
        generation: u64,
        handle: ProcessHandle,
    },
    /// Rate limited; a timer will post a respawn for this generation.
    Waiting {
        job_id: String,
        generation: u64,
    },
    /// The job has left the slot but its process is still being stopped.
    Stopping {
        generation: u64,
    },
}

impl Slot {
    fn job_id(&self) -> Option<&str> {
        match self {
            Slot::Idle | Slot::Stopping { .. } => None,
            Slot::Running { job_id, .. } | Slot::Waiting { job_id, .. } => Some(job_id.as_str()),
        }
    }

    fn is_running(&self, job_id: &str, generation: u64) -> bool {
        matches!(self, Slot::Running { job_id: id, generation: g, .. } if id == job_id && *g == generation)
    }

    fn is_waiting(&self, job_id: &str, generation: u64) -> bool {
        matches!(self, Slot::Waiting { job_id: id, generation: g } if id == job_id && *g == generation)
    }

    fn is_stopping(&self, generation: u64) -> bool {
        matches!(self, Slot::Stopping { generation: g } if *g == generation)
    }
}

/// A process taken out of the slot, to be stopped without holding the
/// state lock.
struct Stopping {
    job_id: String,
    generation: u64,
    handle: ProcessHandle,
}

#[derive(Debug)]
struct Respawn {
    job_id: String,
    generation: u64,
}

struct QueueState {
    jobs: HashMap<String, DownloadJob>,
    slot: Slot,
    next_seq: u64,
    next_generation: u64,
    /// Set by shutdown; nothing is launched afterwards.
    closed: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            slot: Slot::Idle,
            next_seq: 0,
            next_generation: 0,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(AppError::InvalidState("Download queue has been shut down".to_string()));
        }
        Ok(())
    }

    fn take_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn take_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn job_mut(&mut self, job_id: &str) -> Result<&mut DownloadJob> {
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))
    }

    fn active_count(&self) -> usize {
        if self.closed {
            return 0;
        }
        self.jobs
            .values()
            .filter(|job| matches!(job.status, DownloadStatus::Queued | DownloadStatus::Downloading))
            .count()
    }
}

struct Inner {
    state: Mutex<QueueState>,
    options: QueueOptions,
    supervisor: Arc<dyn Supervisor>,
    store: Arc<dyn MetadataStore>,
    validator: InputValidator,
    bus: Bus,
    events_tx: EventSender,
    respawn_tx: mpsc::UnboundedSender<Respawn>,
    idle_tx: watch::Sender<usize>,
}

pub struct DownloadQueue {
    inner: Arc<Inner>,
    coordinator: JoinHandle<()>,
}

impl DownloadQueue {
    /// Builds the queue and spawns its coordinator. Must be called from
    /// within a tokio runtime.
    pub fn start(
        options: QueueOptions,
        supervisor: Arc<dyn Supervisor>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (respawn_tx, respawn_rx) = mpsc::unbounded_channel();
        let (idle_tx, _idle_rx) = watch::channel(0usize);

        log::info!(
            "Starting download queue with supervisor {} into {:?}",
            supervisor.get_name(),
            options.output_dir
        );

        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState::new()),
            bus: Bus::new(options.event_capacity),
            options,
            supervisor,
            store,
            validator: InputValidator::new(),
            events_tx,
            respawn_tx,
            idle_tx,
        });

        let coordinator = tokio::spawn(Self::coordinate(inner.clone(), events_rx, respawn_rx));

        Self { inner, coordinator }
    }

    async fn coordinate(
        inner: Arc<Inner>,
        mut events_rx: EventReceiver,
        mut respawn_rx: mpsc::UnboundedReceiver<Respawn>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events_rx.recv() => inner.handle_event(event).await,
                Some(respawn) = respawn_rx.recv() => inner.handle_respawn(respawn).await,
                else => break,
            }
        }
        log::debug!("Queue coordinator stopped");
    }

    pub async fn add_to_queue(&self, urls: Vec<String>) -> Result<Vec<String>> {
        Ok(self.add_to_queue_with(urls, None).await?.job_ids)
    }

    /// Adds jobs for the given URLs. Invalid URLs are rejected and URLs
    /// already covered by a non-terminal job are skipped; neither aborts
    /// the rest of the batch.
    pub async fn add_to_queue_with(
        &self,
        urls: Vec<String>,
        quality: Option<QualityPreference>,
    ) -> Result<AddOutcome> {
        let quality = quality.unwrap_or(self.inner.options.default_quality);
        let mut outcome = AddOutcome::default();
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;

        for url in urls {
            let url = url.trim().to_string();
            if let Err(e) = self.inner.validator.validate_url(&url) {
                log::warn!("Rejecting {}: {}", url, e);
                outcome.rejected.push(RejectedUrl {
                    url,
                    reason: e.to_string(),
                });
                continue;
            }

            let duplicate = state
                .jobs
                .values()
                .any(|job| job.source_url == url && !job.status.is_terminal());
            if duplicate {
                log::info!("Skipping duplicate {}", url);
                outcome.duplicates.push(url);
                continue;
            }

            let seq = state.take_seq();
            let job = DownloadJob::new(generate_download_id(), url.clone(), quality, seq);
            log::info!("Queued {} as job {}", url, job.id);
            outcome.job_ids.push(job.id.clone());
            self.inner.bus.publish(QueueEvent::JobAdded {
                job_id: job.id.clone(),
                source_url: url,
            });
            state.jobs.insert(job.id.clone(), job);
        }

        self.inner.schedule(&mut state).await;
        Ok(outcome)
    }

    /// Stops the running process and parks the job. The fallback state
    /// is kept so a resume continues the search where it left off.
    pub async fn pause(&self, job_id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let status = state.job_mut(job_id)?.status.clone();
        if status != DownloadStatus::Downloading {
            return Err(AppError::InvalidState(format!(
                "Job {} is {:?}, only downloading jobs can be paused",
                job_id, status
            )));
        }

        let stopping = self.inner.take_slot(&mut state, job_id);
        let job = state.job_mut(job_id)?;
        job.speed = None;
        job.eta = None;
        self.inner.set_status(job, DownloadStatus::Paused);
        log::info!("Paused job {} at {}", job_id, job.fallback);

        self.inner.settle(state, stopping).await;
        Ok(())
    }

    pub async fn resume(&self, job_id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;
        let status = state.job_mut(job_id)?.status.clone();
        match status {
            DownloadStatus::Paused => {
                let seq = state.take_seq();
                let job = state.job_mut(job_id)?;
                job.queued_seq = seq;
                self.inner.set_status(job, DownloadStatus::Queued);
                log::info!("Resumed job {}", job_id);
            }
            DownloadStatus::Queued => {}
            other => {
                return Err(AppError::InvalidState(format!(
                    "Job {} is {:?}, only paused or queued jobs can be resumed",
                    job_id, other
                )))
            }
        }

        self.inner.schedule(&mut state).await;
        Ok(())
    }

    /// Cancelling a job that already reached a terminal status succeeds
    /// without changing it.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.job_mut(job_id)?.status.is_terminal() {
            return Ok(());
        }

        let stopping = self.inner.take_slot(&mut state, job_id);
        let job = state.job_mut(job_id)?;
        job.speed = None;
        job.eta = None;
        self.inner.set_status(job, DownloadStatus::Cancelled);
        log::info!("Cancelled job {}", job_id);

        self.inner.settle(state, stopping).await;
        Ok(())
    }

    /// Re-queues a failed job with a fresh fallback search.
    pub async fn retry(&self, job_id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;
        let status = state.job_mut(job_id)?.status.clone();
        if status != DownloadStatus::Failed {
            return Err(AppError::InvalidState(format!(
                "Job {} is {:?}, only failed jobs can be retried",
                job_id, status
            )));
        }

        let seq = state.take_seq();
        let job = state.job_mut(job_id)?;
        job.fallback = FallbackState::default();
        job.error = None;
        job.error_kind = None;
        job.retryable = false;
        job.progress = 0.0;
        job.started_at = None;
        job.completed_at = None;
        job.queued_seq = seq;
        self.inner.set_status(job, DownloadStatus::Queued);
        log::info!("Retrying job {}", job_id);

        self.inner.schedule(&mut state).await;
        Ok(())
    }

    pub async fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock().await;
        let mut jobs: Vec<DownloadJob> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.queued_seq);

        let total = jobs.len();
        let average_progress = if total == 0 {
            0.0
        } else {
            jobs.iter().map(|job| job.progress).sum::<f32>() / total as f32
        };

        let pick = |status: DownloadStatus| -> Vec<DownloadJob> {
            jobs.iter().filter(|job| job.status == status).cloned().collect()
        };

        let queued = pick(DownloadStatus::Queued);
        let downloading = pick(DownloadStatus::Downloading);
        let paused = pick(DownloadStatus::Paused);
        let failed = pick(DownloadStatus::Failed);
        let completed = pick(DownloadStatus::Completed);
        let cancelled = pick(DownloadStatus::Cancelled);

        let stats = QueueStats {
            total,
            queued: queued.len(),
            downloading: downloading.len(),
            paused: paused.len(),
            failed: failed.len(),
            completed: completed.len(),
            cancelled: cancelled.len(),
            average_progress,
        };

        QueueStatus {
            queued,
            downloading,
            paused,
            failed,
            completed,
            cancelled,
            stats,
        }
    }

    pub async fn job(&self, job_id: &str) -> Option<DownloadJob> {
        let state = self.inner.state.lock().await;
        state.jobs.get(job_id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.bus.subscribe()
    }

    /// Resolves once no job is queued or downloading.
    pub async fn wait_idle(&self) {
        let mut idle_rx = self.inner.idle_tx.subscribe();
        if idle_rx.wait_for(|active| *active == 0).await.is_err() {
            log::debug!("Idle watch closed");
        }
    }

    /// Stops the active process and the coordinator. The interrupted job
    /// goes back to Queued. Adding, resuming or retrying afterwards fails
    /// with `InvalidState`.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        let mut stopping = None;
        if let Some(job_id) = state.slot.job_id().map(str::to_string) {
            stopping = self.inner.take_slot(&mut state, &job_id);
            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.speed = None;
                job.eta = None;
                self.inner.set_status(job, DownloadStatus::Queued);
            }
            log::info!("Interrupted job {} for shutdown", job_id);
        }
        self.inner.settle(state, stopping).await;
        self.coordinator.abort();
        log::info!("Download queue stopped");
    }
}

impl Drop for DownloadQueue {
    fn drop(&mut self) {
        self.coordinator.abort();
    }
}

impl Inner {
    fn set_status(&self, job: &mut DownloadJob, status: DownloadStatus) {
        if job.status == status {
            return;
        }
        job.status = status.clone();
        self.bus.publish(QueueEvent::StatusChanged {
            job_id: job.id.clone(),
            status,
        });
    }

    fn refresh_idle(&self, state: &QueueState) {
        let active = state.active_count();
        self.idle_tx.send_if_modified(|current| {
            if *current == active {
                false
            } else {
                *current = active;
                true
            }
        });
    }

    /// Takes the slot from `job_id` if it holds it. A running process is
    /// handed back to be stopped by [`Inner::settle`]; until then the slot
    /// stays `Stopping` so nothing else is launched.
    fn take_slot(&self, state: &mut QueueState, job_id: &str) -> Option<Stopping> {
        if state.slot.job_id() != Some(job_id) {
            return None;
        }

        match std::mem::replace(&mut state.slot, Slot::Idle) {
            Slot::Running { job_id, generation, handle } => {
                state.slot = Slot::Stopping { generation };
                Some(Stopping {
                    job_id,
                    generation,
                    handle,
                })
            }
            _ => None,
        }
    }

    /// Stops a process taken by [`Inner::take_slot`] with the state lock
    /// released, then refills the slot.
    async fn settle(&self, mut state: MutexGuard<'_, QueueState>, stopping: Option<Stopping>) {
        let Some(Stopping {
            job_id,
            generation,
            mut handle,
        }) = stopping
        else {
            self.schedule(&mut state).await;
            return;
        };

        self.refresh_idle(&state);
        drop(state);

        if let Err(e) = handle.cancel().await {
            log::warn!("Cancelling spawn {} of job {} failed: {}", generation, job_id, e);
        }

        let mut state = self.state.lock().await;
        if state.slot.is_stopping(generation) {
            state.slot = Slot::Idle;
        }
        self.schedule(&mut state).await;
    }

    /// Fills the free slot with the earliest queued job.
    async fn schedule(&self, state: &mut QueueState) {
        while !state.closed && matches!(state.slot, Slot::Idle) {
            let next = state
                .jobs
                .values()
                .filter(|job| job.status == DownloadStatus::Queued)
                .min_by_key(|job| job.queued_seq)
                .map(|job| job.id.clone());

            let Some(job_id) = next else { break };
            let generation = state.take_generation();
            self.launch(state, &job_id, generation).await;
        }
        self.refresh_idle(state);
    }

    /// Spawns the job's current selection into the slot. A spawn error
    /// fails the job and leaves the slot idle.
    async fn launch(&self, state: &mut QueueState, job_id: &str, generation: u64) {
        if state.closed {
            log::debug!("Not launching job {}, queue is shut down", job_id);
            return;
        }

        let request = match state.jobs.get_mut(job_id) {
            Some(job) => {
                job.speed = None;
                job.eta = None;
                job.started_at.get_or_insert_with(chrono::Utc::now);
                self.set_status(job, DownloadStatus::Downloading);
                SpawnRequest::for_job(job, &job.fallback, generation, self.options.output_dir.clone())
            }
            None => return,
        };

        match self.supervisor.spawn(request, self.events_tx.clone()).await {
            Ok(handle) => {
                state.slot = Slot::Running {
                    job_id: job_id.to_string(),
                    generation,
                    handle,
                };
            }
            Err(e) => {
                state.slot = Slot::Idle;
                let classification = match e {
                    AppError::ProcessUnavailable(_) => ErrorClassification::ProcessUnavailable,
                    _ => ErrorClassification::Unknown,
                };
                log::error!("Could not start job {}: {}", job_id, e);
                if let Some(job) = state.jobs.get_mut(job_id) {
                    self.fail_job(job, e.to_string(), classification);
                }
            }
        }
    }

    fn fail_job(&self, job: &mut DownloadJob, message: String, classification: ErrorClassification) {
        let retryable = !classification.is_terminal();
        job.error = Some(message.clone());
        job.error_kind = Some(classification);
        job.retryable = retryable;
        job.speed = None;
        job.eta = None;
        self.set_status(job, DownloadStatus::Failed);
        self.bus.publish(QueueEvent::JobFailed {
            job_id: job.id.clone(),
            message,
            classification,
            retryable,
        });
    }

    async fn handle_event(&self, event: SupervisorEvent) {
        let mut state = self.state.lock().await;
        let mut record = None;
        if !state.slot.is_running(&event.job_id, event.generation) {
            log::debug!(
                "Dropping stale event for job {} (generation {})",
                event.job_id,
                event.generation
            );
            return;
        }

        match event.kind {
            SupervisorEventKind::Progress(sample) => {
                if let Some(job) = state.jobs.get_mut(&event.job_id) {
                    job.progress = sample.percent.clamp(0.0, 100.0);
                    job.speed = sample.speed;
                    job.eta = sample.eta;
                    self.bus.publish(QueueEvent::Progress(job.progress_snapshot()));
                }
            }
            SupervisorEventKind::Completed { path, size } => {
                state.slot = Slot::Idle;
                if let Some(job) = state.jobs.get_mut(&event.job_id) {
                    job.progress = 100.0;
                    job.speed = None;
                    job.eta = None;
                    job.error = None;
                    job.output_path = Some(path.clone());
                    job.file_size = Some(size);
                    job.completed_at = Some(chrono::Utc::now());
                    self.set_status(job, DownloadStatus::Completed);
                    log::info!("Job {} completed: {:?}", job.id, path);

                    self.bus.publish(QueueEvent::JobCompleted {
                        job_id: job.id.clone(),
                        path,
                        size,
                    });

                    record = MetadataRecord::from_job(job);
                }
            }
            SupervisorEventKind::Failed { message, error_type } => {
                self.handle_failure(&mut state, &event.job_id, message, error_type)
                    .await;
            }
        }

        // Written without the lock held; the slot is refilled afterwards.
        if let Some(record) = record {
            drop(state);
            if let Err(e) = self.store.upsert(record).await {
                log::error!("Failed to record metadata for job {}: {}", event.job_id, e);
            }
            state = self.state.lock().await;
        }
        if matches!(state.slot, Slot::Idle) {
            self.schedule(&mut state).await;
        }
    }

    async fn handle_failure(
        &self,
        state: &mut QueueState,
        job_id: &str,
        message: String,
        error_type: Option<String>,
    ) {
        let Some(job) = state.jobs.get_mut(job_id) else {
            state.slot = Slot::Idle;
            self.schedule(state).await;
            return;
        };

        let decision = fallback::decide(&job.fallback, &message, error_type.as_deref(), &self.options.retry);
        job.error = Some(message.clone());
        job.error_kind = Some(decision.classification);
        job.speed = None;
        job.eta = None;

        let Some(next) = decision.next else {
            log::warn!(
                "Job {} failed ({}) after {} fallback attempts: {}",
                job_id,
                decision.classification,
                job.fallback.fallback_attempts,
                message
            );
            state.slot = Slot::Idle;
            self.fail_job(job, message, decision.classification);
            self.schedule(state).await;
            return;
        };

        log::info!(
            "Job {} hit {}; falling back from {} to {} ({} attempts left)",
            job_id,
            decision.classification,
            job.fallback,
            next,
            next.remaining_attempts()
        );
        job.fallback = next;
        self.bus.publish(QueueEvent::FallbackAdvanced {
            job_id: job_id.to_string(),
            classification: decision.classification,
            state: next,
            delay_ms: decision.delay.map(|d| d.as_millis() as u64),
        });

        let generation = state.take_generation();
        match decision.delay {
            Some(delay) => {
                log::info!("Waiting {:?} before respawning job {}", delay, job_id);
                state.slot = Slot::Waiting {
                    job_id: job_id.to_string(),
                    generation,
                };
                let respawn_tx = self.respawn_tx.clone();
                let job_id = job_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = respawn_tx.send(Respawn { job_id, generation });
                });
            }
            None => {
                state.slot = Slot::Idle;
                self.launch(state, job_id, generation).await;
                self.schedule(state).await;
            }
        }
    }

    async fn handle_respawn(&self, respawn: Respawn) {
        let mut state = self.state.lock().await;
        if !state.slot.is_waiting(&respawn.job_id, respawn.generation) {
            log::debug!(
                "Dropping stale respawn for job {} (generation {})",
                respawn.job_id,
                respawn.generation
            );
            return;
        }

        state.slot = Slot::Idle;
        self.launch(&mut state, &respawn.job_id, respawn.generation).await;
        self.schedule(&mut state).await;
    }
}
