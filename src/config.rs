// src/config.rs

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("could not serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Engine settings, read from `settings.toml`. Missing keys take defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub download_dir: PathBuf,
    /// Tasks downloading at once across every job.
    pub max_concurrent_downloads: usize,
    /// Parallel range fetches within one task.
    pub segments_per_file: usize,
    pub user_agent: String,
    /// Connect plus response-header deadline for each request.
    pub request_timeout_secs: u64,
    /// Longest wait for the next body chunk.
    pub read_timeout_secs: u64,
    pub resolve_timeout_secs: u64,
    /// Transient failures retried per segment before the task pauses.
    pub segment_retries: u32,
    pub retry_base_delay_ms: u64,
    /// How often download progress is written to the state database.
    pub save_interval_secs: u64,
    /// Requeue interrupted downloads on start instead of leaving them paused.
    pub resume_on_startup: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            max_concurrent_downloads: 3,
            segments_per_file: 4,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Aura/1.0".to_string(),
            request_timeout_secs: 30,
            read_timeout_secs: 30,
            resolve_timeout_secs: 20,
            segment_retries: 3,
            retry_base_delay_ms: 250,
            save_interval_secs: 5,
            resume_on_startup: false,
        }
    }
}

impl Settings {
    /// Loads `<dir>/settings.toml`, writing the defaults there if it does not exist.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(SETTINGS_FILE);
        if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let settings: Settings = toml::from_str(&contents)?;
            tracing::debug!("loaded settings from {}", path.display());
            Ok(settings.normalized())
        } else {
            let settings = Settings::default();
            settings.save(dir)?;
            Ok(settings)
        }
    }

    pub fn save(&self, dir: &Path) -> Result<(), ConfigError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ConfigError::Io { path, source }
        };
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let path = dir.join(SETTINGS_FILE);
        let contents = toml::to_string_pretty(self)?;
        fs::write(&path, contents).map_err(io_err(&path))?;
        tracing::debug!("saved settings to {}", path.display());
        Ok(())
    }

    /// Clamps limits into workable ranges.
    pub fn normalized(mut self) -> Self {
        self.max_concurrent_downloads = self.max_concurrent_downloads.max(1);
        self.segments_per_file = self.segments_per_file.clamp(1, 16);
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        self.read_timeout_secs = self.read_timeout_secs.max(1);
        self.resolve_timeout_secs = self.resolve_timeout_secs.max(1);
        self.save_interval_secs = self.save_interval_secs.max(1);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}
