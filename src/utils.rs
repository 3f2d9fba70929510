use std::path::{Path, PathBuf};
use crate::errors::{AppError, Result};
use log::{info, warn};

/// Directory under the download path holding in-flight downloads.
pub const STAGING_DIR_NAME: &str = ".tubequeue";

#[cfg(windows)]
const EXDEV: i32 = 17;
#[cfg(not(windows))]
const EXDEV: i32 = 18;

const PARTIAL_EXTENSIONS: &[&str] = &["part", "ytdl", "temp", "tmp"];

/// Generates a unique ID for downloads
pub fn generate_download_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Per-job staging directory where the tool writes before the final move.
pub fn staging_dir(output_dir: &Path, job_id: &str) -> PathBuf {
    output_dir.join(STAGING_DIR_NAME).join(job_id)
}

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Removes a staging directory, logging instead of failing.
pub async fn remove_dir_best_effort(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}

fn is_partial_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if name.contains(".part-Frag") {
        return true;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| PARTIAL_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Picks the finished media file in a staging directory: the largest
/// regular file that is not a partial download.
pub async fn find_downloaded_file(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut best: Option<(u64, PathBuf)> = None;
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let metadata = entry.metadata().await?;
        if !metadata.is_file() || is_partial_file(&path) {
            continue;
        }
        let size = metadata.len();
        if best.as_ref().map_or(true, |(best_size, _)| size > *best_size) {
            best = Some((size, path));
        }
    }

    Ok(best.map(|(_, path)| path))
}

/// Moves a file, retrying transient failures such as a file still being
/// held open by a just-exited process.
pub async fn move_with_retry(from: &Path, to: &Path) -> Result<()> {
    let mut retries = 5;
    let base_delay = 100;

    loop {
        match tokio::fs::rename(from, to).await {
            Ok(_) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(EXDEV) => {
                // staging and destination on different filesystems
                tokio::fs::copy(from, to).await?;
                tokio::fs::remove_file(from).await?;
                return Ok(());
            }
            Err(e) if (e.kind() == std::io::ErrorKind::PermissionDenied
                || e.kind() == std::io::ErrorKind::AlreadyExists)
                && retries > 1 =>
            {
                let delay = base_delay * (6 - retries);
                warn!("Moving {:?} failed ({}), retrying in {}ms", from, e, delay);
                tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
                retries -= 1;
            }
            Err(e) => {
                return Err(AppError::Download(format!(
                    "Failed to move {:?} to {:?}: {}",
                    from, to, e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ids_are_unique() {
        assert_ne!(generate_download_id(), generate_download_id());
    }

    #[test]
    fn staging_dir_is_nested_per_job() {
        let dir = staging_dir(Path::new("/downloads"), "abc");
        assert_eq!(dir, PathBuf::from("/downloads/.tubequeue/abc"));
    }

    #[tokio::test]
    async fn find_downloaded_file_skips_partials() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("video.mp4.part"), vec![0u8; 4096]).unwrap();
        std::fs::write(dir.path().join("video.mp4"), vec![0u8; 1024]).unwrap();
        std::fs::write(dir.path().join("video.f137.mp4.part-Frag3"), vec![0u8; 8192]).unwrap();

        let found = find_downloaded_file(dir.path()).await.unwrap();
        assert_eq!(found, Some(dir.path().join("video.mp4")));
    }

    #[tokio::test]
    async fn find_downloaded_file_handles_missing_dir() {
        let dir = tempdir().unwrap();
        let found = find_downloaded_file(&dir.path().join("nope")).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn move_with_retry_moves_file() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("a.mp4");
        let to = dir.path().join("b.mp4");
        std::fs::write(&from, b"data").unwrap();

        move_with_retry(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"data");
    }
}
