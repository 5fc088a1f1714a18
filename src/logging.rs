// src/logging.rs

use anyhow::{anyhow, Result};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "aura_downloads.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,aura_downloads=debug"))
}

/// Initialize structured logging to `<dir>/aura_downloads.log`.
pub fn init_logging(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let log_file_path = dir.join(LOG_FILE);

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!(e))?;

    tracing::info!("logging initialized at {}", log_file_path.display());
    Ok(())
}

/// Logs to stderr instead; used by the command line front end.
pub fn init_logging_stderr() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!(e))
}
