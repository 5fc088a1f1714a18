// src/manager.rs

use crate::config::{ConfigError, Settings};
use crate::models::{
    episode_dest_path, DownloadBuckets, DownloadJob, DownloadTask, Episode, EpisodeError,
    ResumeReport, StartDownloadReport, TaskError, TaskStatus,
};
use crate::registry::{Registry, RemovedTask, ValidationError};
use crate::resolver::{LinkResolver, ResolverBridge};
use crate::scheduler::Scheduler;
use crate::state_manager::{StateError, StateManager};
use crate::worker::WorkerContext;
use futures_util::future::join_all;
use reqwest::Client;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const STATE_DB_FILE: &str = "downloads.db";

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("settings error: {0}")]
    Config(#[from] ConfigError),
    #[error("could not build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// The central component the UI talks to. Owns the registry, the scheduler
/// and the persistence loop.
pub struct DownloadManager {
    registry: Registry,
    state_manager: StateManager,
    bridge: ResolverBridge,
    settings: Arc<RwLock<Settings>>,
    config_dir: Option<PathBuf>,
    // Stops the scheduler and, through child tokens, every worker.
    shutdown: CancellationToken,
    // Stops the persistence loop, after the workers have drained.
    persist_shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadManager {
    /// Loads `settings.toml` and the state database from `config_dir`, then
    /// starts the engine.
    pub async fn open(
        config_dir: &Path,
        resolver: Arc<dyn LinkResolver>,
    ) -> Result<Self, ManagerError> {
        let settings = Settings::load(config_dir)?;
        let state_manager = StateManager::new(&config_dir.join(STATE_DB_FILE)).await?;
        let mut manager = Self::new(settings, resolver, state_manager).await?;
        manager.config_dir = Some(config_dir.to_path_buf());
        Ok(manager)
    }

    /// Restores persisted jobs and starts the scheduler and the sync loop.
    pub async fn new(
        settings: Settings,
        resolver: Arc<dyn LinkResolver>,
        state_manager: StateManager,
    ) -> Result<Self, ManagerError> {
        let settings = settings.normalized();
        let loaded_jobs = state_manager.load_all_jobs().await?;
        tracing::info!("restoring {} job(s)", loaded_jobs.len());
        let registry = Registry::restore(loaded_jobs, settings.resume_on_startup);

        let http_client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(settings.request_timeout())
            .build()?;
        let bridge = ResolverBridge::new(resolver, settings.resolve_timeout());
        let save_interval = settings.save_interval();
        let settings = Arc::new(RwLock::new(settings));

        let shutdown = CancellationToken::new();
        let persist_shutdown = CancellationToken::new();

        let context = WorkerContext::new(registry.clone(), http_client, bridge.clone());
        let scheduler = Scheduler::new(context, settings.clone(), shutdown.clone());
        let scheduler_handle = tokio::spawn(scheduler.run());
        let sync_handle = tokio::spawn(state_manager.clone().sync_loop(
            registry.clone(),
            save_interval,
            persist_shutdown.clone(),
        ));

        Ok(Self {
            registry,
            state_manager,
            bridge,
            settings,
            config_dir: None,
            shutdown,
            persist_shutdown,
            background: Mutex::new(vec![scheduler_handle, sync_handle]),
        })
    }

    /// Queues one job with a task per accepted episode. Episodes that cannot
    /// be queued are listed in the report's `errors`.
    pub async fn start_download(
        &self,
        anime_title: &str,
        episodes: Vec<Episode>,
    ) -> Result<StartDownloadReport, ManagerError> {
        let download_dir = self.settings().download_dir;

        let mut errors = Vec::new();
        let mut fresh = Vec::with_capacity(episodes.len());
        let requested = episodes.len();
        for episode in episodes {
            let dest = episode_dest_path(&download_dir, anime_title, episode.episode_number);
            if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
                errors.push(EpisodeError {
                    episode_number: episode.episode_number,
                    message: "episode is already downloaded".into(),
                });
            } else {
                fresh.push(episode);
            }
        }
        if requested > 0 && fresh.is_empty() {
            return Err(ValidationError {
                message: "no episode could be queued".into(),
                rejected: errors,
            }
            .into());
        }

        let enqueued = self.registry.enqueue(anime_title, fresh, &download_dir).map_err(|mut e| {
            errors.append(&mut e.rejected);
            e.rejected = std::mem::take(&mut errors);
            e
        })?;
        errors.extend(enqueued.rejected);
        errors.sort_by_key(|e| e.episode_number);

        Ok(StartDownloadReport {
            job_id: Some(enqueued.job.id.clone()),
            queued: enqueued.job.tasks.len(),
            task_ids: enqueued.job.tasks.iter().map(|t| t.id.clone()).collect(),
            errors,
        })
    }

    /// All jobs, newest first.
    pub fn get_downloads(&self) -> Vec<DownloadJob> {
        self.registry.jobs()
    }

    pub fn get_download_buckets(&self) -> DownloadBuckets {
        self.registry.buckets()
    }

    pub fn get_job(&self, job_id: &str) -> Option<DownloadJob> {
        self.registry.job(job_id)
    }

    pub fn get_task(&self, task_id: &str) -> Option<DownloadTask> {
        self.registry.task(task_id)
    }

    /// Pauses a whole job, or one task of it. Returns how many tasks paused.
    pub fn pause_download(&self, job_id: &str, task_id: Option<&str>) -> usize {
        self.registry.pause(job_id, task_id)
    }

    /// Requeues paused and failed tasks. Tasks whose link expired get one
    /// fresh resolution attempt first; failures leave them paused.
    pub async fn resume_download(&self, job_id: &str, task_id: Option<&str>) -> ResumeReport {
        let (mut requeued, needs_link) = self.registry.resume(job_id, task_id);

        let resolutions = join_all(needs_link.into_iter().map(|(id, episode)| async move {
            let result = self.bridge.resolve(&episode).await;
            (id, result)
        }))
        .await;

        let mut failed = Vec::new();
        for (id, result) in resolutions {
            match result {
                Ok(url) => {
                    if self.registry.requeue_with_link(&id, url) {
                        requeued.push(id);
                    }
                }
                Err(e) => {
                    tracing::warn!("could not refresh link for task {}: {}", id, e);
                    let message = e.to_string();
                    self.registry.note_error(&id, message.clone());
                    failed.push(TaskError {
                        task_id: id,
                        message,
                    });
                }
            }
        }
        ResumeReport { requeued, failed }
    }

    /// Removes a task and its partial file. Completed tasks and unknown ids
    /// are left alone and return `false`.
    pub async fn cancel_download(&self, task_id: &str) -> bool {
        match self.registry.cancel(task_id) {
            Some(removed) => {
                discard(removed).await;
                true
            }
            None => false,
        }
    }

    /// Removes a job. Partial files are deleted, finished episodes stay.
    pub async fn remove_job(&self, job_id: &str) -> usize {
        let removed = self.registry.remove_job(job_id);
        let count = removed.len();
        for task in removed {
            discard(task).await;
        }
        count
    }

    /// Forgets every fully completed job. Files stay on disk.
    pub fn clear_completed(&self) -> usize {
        self.registry.clear_completed()
    }

    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the settings. Workers already running keep the snapshot they
    /// were admitted with; concurrency changes apply on the next scan.
    pub fn update_settings(&self, settings: Settings) -> Result<(), ManagerError> {
        let settings = settings.normalized();
        if let Some(dir) = &self.config_dir {
            settings.save(dir)?;
        }
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
        tracing::info!("settings updated");
        self.registry.request_admission();
        Ok(())
    }

    /// Stops every worker, waits for them to report, then writes the final
    /// state. Interrupted tasks end up paused.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down download manager");
        self.shutdown.cancel();
        for handle in self.registry.stop_all() {
            if let Err(e) = handle.await {
                tracing::error!("worker ended abnormally: {}", e);
            }
        }
        self.persist_shutdown.cancel();
        let background = std::mem::take(
            &mut *self.background.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in background {
            let _ = handle.await;
        }
        self.state_manager.flush(&self.registry).await;
    }
}

/// Waits for the task's worker to exit, then deletes whatever it left behind.
async fn discard(removed: RemovedTask) {
    if let Some(handle) = removed.handle {
        if let Err(e) = handle.await {
            tracing::error!("worker for task {} ended abnormally: {}", removed.task.id, e);
        }
    }
    if removed.task.status == TaskStatus::Completed {
        return;
    }
    for path in [removed.task.temporary_path(), removed.task.dest_path.clone()] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!("deleted {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("could not delete {}: {}", path.display(), e),
        }
    }
}
