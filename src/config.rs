use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use crate::downloader::catalog::QualityPreference;
use crate::downloader::fallback::RetryPolicy;
use crate::errors::{AppError, Result};

/// Prefix for environment overrides, e.g. `TUBEQUEUE_YTDLP_PATH`.
pub const ENV_PREFIX: &str = "TUBEQUEUE";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub download_path: PathBuf,
    pub ytdlp_path: String,
    pub ffmpeg_path: Option<PathBuf>,
    pub proxy: Option<String>,
    pub cookies_file: Option<PathBuf>,
    pub preferred_quality: QualityPreference,
    pub retry: RetryConfig,
    /// How long a cancelled process gets to exit before it is killed.
    pub cancel_grace_ms: u64,
    pub event_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_path: dirs::download_dir()
                .unwrap_or_else(|| PathBuf::from("./downloads")),
            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: None,
            proxy: None,
            cookies_file: None,
            preferred_quality: QualityPreference::default(),
            retry: RetryConfig::default(),
            cancel_grace_ms: 3000,
            event_capacity: 256,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            factor: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.base_delay_ms),
            cap: Duration::from_millis(self.max_delay_ms),
            factor: self.factor,
        }
    }
}

impl AppConfig {
    /// Loads the config file (if any) and applies environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        Self::load_from(Some(&config_path))
    }

    pub fn load_from(path: Option<&std::path::Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, config_path: &std::path::Path) -> Result<()> {
        if let Some(config_dir) = config_path.parent() {
            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AppError::Config(config::ConfigError::Message("Could not find config directory".to_string())))?;

        Ok(config_dir.join("tubequeue").join("config.json"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.ytdlp_path.trim().is_empty() {
            return Err(AppError::Validation("ytdlp_path cannot be empty".to_string()));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(AppError::Validation("retry.base_delay_ms must be positive".to_string()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(AppError::Validation(
                "retry.max_delay_ms must not be smaller than retry.base_delay_ms".to_string(),
            ));
        }
        if !self.retry.factor.is_finite() || self.retry.factor < 1.0 {
            return Err(AppError::Validation("retry.factor must be at least 1.0".to_string()));
        }
        Ok(())
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ytdlp_path, "yt-dlp");
        assert_eq!(config.retry.policy(), RetryPolicy::default());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = AppConfig::load_from(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(config.cancel_grace_ms, 3000);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "ytdlp_path": "/opt/yt-dlp", "preferred_quality": "hd720", "retry": { "base_delay_ms": 500 } }"#,
        )
        .unwrap();

        let config = AppConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.ytdlp_path, "/opt/yt-dlp");
        assert_eq!(config.preferred_quality, QualityPreference::Hd720);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.retry.max_delay_ms, 60_000);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = AppConfig {
            proxy: Some("socks5://127.0.0.1:1080".to_string()),
            cancel_grace_ms: 250,
            ..AppConfig::default()
        };
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(Some(&path)).unwrap();
        assert_eq!(loaded.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
        assert_eq!(loaded.cancel_grace_ms, 250);
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let config = AppConfig {
            retry: RetryConfig {
                base_delay_ms: 1000,
                max_delay_ms: 10,
                factor: 2.0,
            },
            ..AppConfig::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Validation(_))));
    }
}
