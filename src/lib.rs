pub mod commands;
pub mod config;
pub mod downloader;
pub mod errors;
pub mod metadata;
pub mod security;
pub mod utils;

pub use downloader::{DownloadJob, DownloadQueue, DownloadStatus, YtDlpSupervisor};
pub use errors::{AppError, Result};
