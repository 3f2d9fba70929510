use crate::errors::{AppError, Result};
use url::Url;
use std::path::Path;

const MAX_URL_LENGTH: usize = 2048;

const SUPPORTED_HOSTS: &[&str] = &["youtube.com", "youtu.be", "youtube-nocookie.com"];

#[derive(Debug, Clone, Default)]
pub struct InputValidator;

impl InputValidator {
    pub fn new() -> Self {
        Self
    }

    /// Accepts http(s) URLs on the video platform's domains, including
    /// subdomains such as `www.`, `m.` and `music.`.
    pub fn validate_url(&self, url: &str) -> Result<()> {
        let url = url.trim();
        if url.is_empty() {
            return Err(AppError::Validation("URL cannot be empty".to_string()));
        }

        if url.len() > MAX_URL_LENGTH {
            return Err(AppError::Validation(format!(
                "URL too long (max {} characters)",
                MAX_URL_LENGTH
            )));
        }

        let parsed_url = Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

        if !matches!(parsed_url.scheme(), "http" | "https") {
            return Err(AppError::Validation(format!(
                "Unsupported scheme: {}",
                parsed_url.scheme()
            )));
        }

        let host = parsed_url.host_str()
            .ok_or_else(|| AppError::Validation("URL must have a host".to_string()))?
            .to_lowercase();

        let is_supported = SUPPORTED_HOSTS.iter().any(|domain| {
            host == *domain || host.ends_with(&format!(".{}", domain))
        });

        if !is_supported {
            return Err(AppError::Validation(format!(
                "Unsupported platform: {}. Supported: {}",
                host,
                SUPPORTED_HOSTS.join(", ")
            )));
        }

        Ok(())
    }

    pub fn validate_job_id(&self, job_id: &str) -> Result<()> {
        if job_id.trim().is_empty() {
            return Err(AppError::InvalidInput("Job id cannot be empty".to_string()));
        }
        if job_id.len() > 64 || !job_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(AppError::InvalidInput(format!("Malformed job id: {}", job_id)));
        }
        Ok(())
    }

    /// The directory may not exist yet; when it does it must be a
    /// writable directory.
    pub fn validate_download_path(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(AppError::Validation("Download path cannot be empty".to_string()));
        }

        if path.components().any(|component| {
            matches!(component, std::path::Component::ParentDir)
        }) {
            return Err(AppError::Validation("Path traversal detected".to_string()));
        }

        if !path.exists() {
            return Ok(());
        }

        if !path.is_dir() {
            return Err(AppError::Validation("Download path is not a directory".to_string()));
        }

        if path.metadata()?.permissions().readonly() {
            return Err(AppError::Validation("Download path is read-only".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_platform_urls() {
        let validator = InputValidator::new();
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://music.youtube.com/watch?v=abc",
            "http://m.youtube.com/watch?v=abc",
            "  https://www.youtube.com/shorts/abc  ",
        ] {
            assert!(validator.validate_url(url).is_ok(), "{}", url);
        }
    }

    #[test]
    fn rejects_other_urls() {
        let validator = InputValidator::new();
        for url in [
            "",
            "not a url",
            "ftp://youtube.com/video",
            "https://vimeo.com/123",
            "https://notyoutube.com/watch?v=abc",
        ] {
            assert!(
                matches!(validator.validate_url(url), Err(AppError::Validation(_))),
                "{}",
                url
            );
        }
    }

    #[test]
    fn job_ids_must_look_like_ids() {
        let validator = InputValidator::new();
        assert!(validator.validate_job_id(&crate::utils::generate_download_id()).is_ok());
        assert!(validator.validate_job_id("").is_err());
        assert!(validator.validate_job_id("../etc").is_err());
    }

    #[test]
    fn download_path_checks() {
        let validator = InputValidator::new();
        let dir = tempfile::tempdir().unwrap();
        assert!(validator.validate_download_path(dir.path()).is_ok());
        assert!(validator.validate_download_path(&dir.path().join("not-yet")).is_ok());
        assert!(validator.validate_download_path(Path::new("../outside")).is_err());

        let file = dir.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(validator.validate_download_path(&file).is_err());
    }
}
