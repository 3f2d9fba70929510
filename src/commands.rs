use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::downloader::catalog::QualityPreference;
use crate::downloader::manager::{DownloadQueue, QueueStatus};
use crate::errors::Result;
use crate::security::InputValidator;

/// Command surface over the queue. Failures are reported in the response
/// body instead of as errors so callers always get something to render.
pub struct QueueCommands {
    pub queue: Arc<DownloadQueue>,
    validator: InputValidator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddToQueueRequest {
    pub urls: Vec<String>,
    pub quality: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddToQueueResponse {
    pub success: bool,
    pub job_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandResponse {
    fn from_result(result: Result<()>, action: &str, job_id: &str) -> Self {
        match result {
            Ok(()) => Self {
                success: true,
                message: Some(format!("{} {}", action, job_id)),
            },
            Err(e) => {
                log::warn!("{} {} failed: {}", action, job_id, e);
                Self {
                    success: false,
                    message: Some(e.to_string()),
                }
            }
        }
    }
}

impl QueueCommands {
    pub fn new(queue: Arc<DownloadQueue>) -> Self {
        Self {
            queue,
            validator: InputValidator::new(),
        }
    }

    pub async fn add_to_queue(&self, request: AddToQueueRequest) -> AddToQueueResponse {
        if request.urls.is_empty() {
            return AddToQueueResponse {
                success: false,
                job_ids: Vec::new(),
                message: Some("No URLs provided".to_string()),
            };
        }

        let quality = match request.quality.as_deref().map(str::parse::<QualityPreference>) {
            None => None,
            Some(Ok(quality)) => Some(quality),
            Some(Err(e)) => {
                return AddToQueueResponse {
                    success: false,
                    job_ids: Vec::new(),
                    message: Some(e.to_string()),
                }
            }
        };

        let outcome = match self.queue.add_to_queue_with(request.urls, quality).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return AddToQueueResponse {
                    success: false,
                    job_ids: Vec::new(),
                    message: Some(e.to_string()),
                }
            }
        };

        let mut notes = vec![format!("Queued {} download(s)", outcome.job_ids.len())];
        if !outcome.duplicates.is_empty() {
            notes.push(format!("{} already in queue", outcome.duplicates.len()));
        }
        for rejected in &outcome.rejected {
            notes.push(format!("rejected {}: {}", rejected.url, rejected.reason));
        }

        AddToQueueResponse {
            success: !outcome.job_ids.is_empty() || outcome.rejected.is_empty(),
            job_ids: outcome.job_ids,
            message: Some(notes.join("; ")),
        }
    }

    pub async fn get_queue_status(&self) -> QueueStatus {
        self.queue.status().await
    }

    pub async fn pause(&self, job_id: &str) -> CommandResponse {
        let result = match self.validator.validate_job_id(job_id) {
            Ok(()) => self.queue.pause(job_id).await,
            Err(e) => Err(e),
        };
        CommandResponse::from_result(result, "Paused", job_id)
    }

    pub async fn resume(&self, job_id: &str) -> CommandResponse {
        let result = match self.validator.validate_job_id(job_id) {
            Ok(()) => self.queue.resume(job_id).await,
            Err(e) => Err(e),
        };
        CommandResponse::from_result(result, "Resumed", job_id)
    }

    pub async fn cancel(&self, job_id: &str) -> CommandResponse {
        let result = match self.validator.validate_job_id(job_id) {
            Ok(()) => self.queue.cancel(job_id).await,
            Err(e) => Err(e),
        };
        CommandResponse::from_result(result, "Cancelled", job_id)
    }

    pub async fn retry(&self, job_id: &str) -> CommandResponse {
        let result = match self.validator.validate_job_id(job_id) {
            Ok(()) => self.queue.retry(job_id).await,
            Err(e) => Err(e),
        };
        CommandResponse::from_result(result, "Retrying", job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::fallback::RetryPolicy;
    use crate::downloader::manager::QueueOptions;
    use crate::downloader::supervisor::{EventEmitter, EventSender, ProcessHandle, SpawnRequest, Supervisor};
    use crate::metadata::InMemoryMetadataStore;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tokio::sync::oneshot;

    /// Never finishes until cancelled.
    struct StallingSupervisor;

    #[async_trait]
    impl Supervisor for StallingSupervisor {
        async fn spawn(&self, request: SpawnRequest, events: EventSender) -> Result<ProcessHandle> {
            let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
            let emitter = EventEmitter::new(request.job_id.clone(), request.generation, events);
            let task = tokio::spawn(async move {
                let _ = cancel_rx.await;
                drop(emitter);
            });
            Ok(ProcessHandle::new(request.job_id, request.generation, cancel_tx, task))
        }

        fn get_name(&self) -> &str {
            "stalling"
        }
    }

    fn commands() -> QueueCommands {
        let options = QueueOptions {
            output_dir: PathBuf::from("/downloads"),
            default_quality: QualityPreference::default(),
            retry: RetryPolicy::default(),
            event_capacity: 16,
        };
        let queue = DownloadQueue::start(
            options,
            Arc::new(StallingSupervisor),
            Arc::new(InMemoryMetadataStore::new()),
        );
        QueueCommands::new(Arc::new(queue))
    }

    fn request(urls: &[&str], quality: Option<&str>) -> AddToQueueRequest {
        AddToQueueRequest {
            urls: urls.iter().map(|url| url.to_string()).collect(),
            quality: quality.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn add_reports_ids_and_rejections() {
        let commands = commands();
        let response = commands
            .add_to_queue(request(
                &["https://youtu.be/abcdefghijk", "https://example.com/nope"],
                Some("720p"),
            ))
            .await;

        assert!(response.success);
        assert_eq!(response.job_ids.len(), 1);
        assert!(response.message.unwrap().contains("rejected https://example.com/nope"));

        let job = commands.queue.job(&response.job_ids[0]).await.unwrap();
        assert_eq!(job.quality, QualityPreference::Hd720);
    }

    #[tokio::test]
    async fn add_rejects_bad_quality_and_empty_batches() {
        let commands = commands();
        assert!(!commands.add_to_queue(request(&[], None)).await.success);

        let response = commands
            .add_to_queue(request(&["https://youtu.be/abcdefghijk"], Some("8k-hdr")))
            .await;
        assert!(!response.success);
        assert!(response.job_ids.is_empty());

        let response = commands
            .add_to_queue(request(&["ftp://youtu.be/abcdefghijk"], None))
            .await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn job_commands_map_errors_to_responses() {
        let commands = commands();
        let response = commands
            .add_to_queue(request(&["https://youtu.be/abcdefghijk"], None))
            .await;
        let id = response.job_ids[0].clone();

        assert!(commands.pause(&id).await.success);
        assert!(commands.resume(&id).await.success);
        assert!(!commands.retry(&id).await.success);
        assert!(commands.cancel(&id).await.success);
        assert!(commands.cancel(&id).await.success);

        let missing = commands.pause("no-such-job").await;
        assert!(!missing.success);
        assert!(missing.message.unwrap().contains("not found"));

        let malformed = commands.cancel("../../etc").await;
        assert!(!malformed.success);

        let status = commands.get_queue_status().await;
        assert_eq!(status.stats.cancelled, 1);
    }

    #[test]
    fn responses_omit_empty_message() {
        let json = serde_json::to_value(CommandResponse {
            success: true,
            message: None,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "success": true }));
    }
}
