// src/main.rs

use anyhow::{bail, Context, Result};
use aura_downloads::logging::{init_logging, init_logging_stderr};
use aura_downloads::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Queues direct episode links under one title and waits until they settle:
///
/// ```text
/// aura-dl "Show Title" https://host/ep1.mp4 https://host/ep2.mp4
/// ```
///
/// Settings and state live in `$AURA_DL_HOME` (default `./.aura`). Logs go to
/// stderr, or to `aura_downloads.log` in that directory when
/// `AURA_DL_LOG_FILE` is set.
#[tokio::main]
async fn main() -> Result<()> {
    let home = std::env::var_os("AURA_DL_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".aura"));
    if std::env::var_os("AURA_DL_LOG_FILE").is_some() {
        init_logging(&home)?;
    } else {
        init_logging_stderr()?;
    }

    let mut args = std::env::args().skip(1);
    let Some(title) = args.next() else {
        bail!("usage: aura-dl <title> <url>...");
    };
    let episodes: Vec<Episode> = args
        .enumerate()
        .map(|(i, url)| Episode {
            url,
            gate_id: None,
            episode_number: i as u32 + 1,
            name: format!("Episode {}", i + 1),
        })
        .collect();
    if episodes.is_empty() {
        bail!("no episode urls given");
    }

    let manager = DownloadManager::open(&home, Arc::new(PassthroughResolver))
        .await
        .with_context(|| format!("could not start the download engine in {}", home.display()))?;

    let report = manager.start_download(&title, episodes).await?;
    for error in &report.errors {
        tracing::warn!("episode {} skipped: {}", error.episode_number, error.message);
    }
    let Some(job_id) = report.job_id else {
        bail!("nothing was queued");
    };
    tracing::info!("queued {} episode(s) as job {}", report.queued, job_id);

    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
        }
        let Some(job) = manager.get_job(&job_id) else {
            bail!("job disappeared from the registry");
        };
        for task in &job.tasks {
            tracing::info!(
                "episode {:02}: {} {:.1}%",
                task.episode.episode_number,
                task.status.label(),
                task.progress() * 100.0
            );
        }
        let settled = job
            .tasks
            .iter()
            .all(|t| !matches!(t.status, TaskStatus::Pending | TaskStatus::Downloading));
        if settled {
            break;
        }
    }

    manager.shutdown().await;
    if interrupted {
        tracing::info!("interrupted; unfinished episodes were saved as paused");
        return Ok(());
    }

    let job = manager.get_job(&job_id);
    let failed: Vec<_> = job
        .iter()
        .flat_map(|j| j.tasks.iter())
        .filter(|t| t.status != TaskStatus::Completed)
        .collect();
    if !failed.is_empty() {
        for task in &failed {
            tracing::error!(
                "episode {} did not finish: {}",
                task.episode.episode_number,
                task.last_error.as_deref().unwrap_or(task.status.label())
            );
        }
        bail!("{} episode(s) did not finish", failed.len());
    }
    tracing::info!("all episodes downloaded");
    Ok(())
}
