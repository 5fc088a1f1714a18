// src/scheduler.rs

use crate::config::Settings;
use crate::models::TaskStatus;
use crate::registry::{Registry, RegistryState, RunningTask};
use crate::worker::{Assignment, DownloadWorker, WorkerContext};
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Admits pending tasks into execution, oldest first, without ever running
/// more than `max_concurrent_downloads` workers across the whole registry.
pub struct Scheduler {
    registry: Registry,
    settings: Arc<RwLock<Settings>>,
    context: WorkerContext,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        context: WorkerContext,
        settings: Arc<RwLock<Settings>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry: context.registry.clone(),
            settings,
            context,
            shutdown,
        }
    }

    /// Rescans whenever the registry reports a change that could free a slot
    /// or add work, until shutdown.
    pub async fn run(self) {
        tracing::debug!("scheduler started");
        loop {
            self.admit_ready();
            tokio::select! {
                _ = self.registry.admission_requested() => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
        tracing::debug!("scheduler stopped");
    }

    /// Starts workers for as many pending tasks as capacity allows.
    /// Returns the admitted task ids.
    pub fn admit_ready(&self) -> Vec<String> {
        let settings = self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        // Selection, the status change and the slot reservation happen under
        // one write guard, so two scans can never over-admit.
        let mut state = self.registry.write();
        let picks = select_admissions(&state, settings.max_concurrent_downloads);
        let mut admitted = Vec::with_capacity(picks.len());

        for task_id in picks {
            let generation = state.next_generation();
            let Some(task) = state.task_mut(&task_id) else {
                continue;
            };
            if let Err(e) = task.admit() {
                tracing::warn!("{}", e);
                continue;
            }
            let token = self.shutdown.child_token();
            let assignment = Assignment {
                task_id: task.id.clone(),
                generation,
                episode: task.episode.clone(),
                url: task.url.clone(),
                dest_path: task.dest_path.clone(),
                token: token.clone(),
                settings: settings.clone(),
            };
            tracing::info!(
                "admitting task {} (episode {})",
                task.id,
                task.episode.episode_number
            );
            let handle = tokio::spawn(DownloadWorker::run(self.context.clone(), assignment));
            state.running.insert(
                task_id.clone(),
                RunningTask {
                    generation,
                    token,
                    handle: Some(handle),
                },
            );
            admitted.push(task_id);
        }
        if !admitted.is_empty() {
            tracing::debug!(
                "{} task(s) downloading, limit {}",
                state.downloading_count(),
                settings.max_concurrent_downloads
            );
        }
        admitted
    }
}

/// Oldest pending tasks that fit into the free capacity. A task whose previous
/// worker is still draining keeps its slot and is not picked again yet.
pub(crate) fn select_admissions(state: &RegistryState, limit: usize) -> Vec<String> {
    let free = limit.max(1).saturating_sub(state.running.len());
    if free == 0 {
        return Vec::new();
    }
    let mut pending: Vec<_> = state
        .jobs
        .iter()
        .flat_map(|j| j.tasks.iter())
        .filter(|t| t.status == TaskStatus::Pending && !state.running.contains_key(&t.id))
        .collect();
    pending.sort_by_key(|t| t.seq);
    pending
        .into_iter()
        .take(free)
        .map(|t| t.id.clone())
        .collect()
}
