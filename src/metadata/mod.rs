use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::downloader::DownloadJob;
use crate::errors::Result;

/// What is known about a finished download.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataRecord {
    pub job_id: String,
    pub source_url: String,
    pub title: String,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

impl MetadataRecord {
    /// `None` until the job has an output file.
    pub fn from_job(job: &DownloadJob) -> Option<Self> {
        let file_path = job.output_path.clone()?;
        let title = file_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| job.source_url.clone());

        Some(Self {
            job_id: job.id.clone(),
            source_url: job.source_url.clone(),
            title,
            file_path,
            file_size: job.file_size.unwrap_or(0),
            completed_at: job.completed_at.unwrap_or_else(chrono::Utc::now),
        })
    }
}

#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    async fn upsert(&self, record: MetadataRecord) -> Result<()>;
    async fn get(&self, job_id: &str) -> Result<Option<MetadataRecord>>;
}

#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<HashMap<String, MetadataRecord>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait::async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn upsert(&self, record: MetadataRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(record.job_id.clone(), record);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<MetadataRecord>> {
        let records = self.records.read().await;
        Ok(records.get(job_id).cloned())
    }
}
