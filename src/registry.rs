//! Process-wide store of jobs and tasks.
//!
//! All mutations go through one `RwLock` write guard, so status polling always
//! sees whole tasks. The lock is never held across an `.await`.

use crate::models::{
    create_segments, episode_dest_path, numbered_path, DownloadBuckets, DownloadJob, DownloadTask,
    Episode, EpisodeError, PauseReason, Segment, TaskStatus,
};
use crate::downloader::RemoteFile;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("validation error: {message}")]
pub struct ValidationError {
    pub message: String,
    pub rejected: Vec<EpisodeError>,
}

/// How a worker's attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Paused(PauseReason, String),
    Failed(String),
    /// The server answered a ranged GET with the whole body. The task is
    /// requeued to stream the file in one piece.
    RangesIgnored(String),
    /// Stopped on request (pause, cancel, shutdown).
    Stopped,
}

/// The segment plan a worker should execute.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub segments: Vec<Segment>,
    pub total_bytes: Option<u64>,
    pub accepts_ranges: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("task is no longer running")]
    Stale,
    #[error("remote file changed or stopped honoring ranges; the download restarts on resume")]
    Conflict,
}

pub struct Enqueued {
    pub job: DownloadJob,
    pub rejected: Vec<EpisodeError>,
}

/// A task taken out of the registry by cancel or job removal.
pub struct RemovedTask {
    pub task: DownloadTask,
    /// Worker still running for the task, if any. Await it before touching files.
    pub handle: Option<JoinHandle<()>>,
}

pub(crate) struct RunningTask {
    pub generation: u64,
    pub token: CancellationToken,
    pub handle: Option<JoinHandle<()>>,
}

/// Jobs that need writing out since the last sync.
#[derive(Debug, Default)]
pub struct PendingWrites {
    pub saves: Vec<DownloadJob>,
    pub deletes: Vec<String>,
}

impl PendingWrites {
    pub fn is_empty(&self) -> bool {
        self.saves.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct RegistryState {
    /// Creation order.
    pub jobs: Vec<DownloadJob>,
    /// One entry per live worker; this table is the admission counter.
    pub running: HashMap<String, RunningTask>,
    next_seq: u64,
    next_generation: u64,
    dirty: HashSet<String>,
    removed: HashSet<String>,
}

impl RegistryState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn locate(&self, task_id: &str) -> Option<(usize, usize)> {
        self.jobs.iter().enumerate().find_map(|(j, job)| {
            job.tasks
                .iter()
                .position(|t| t.id == task_id)
                .map(|t| (j, t))
        })
    }

    pub fn task(&self, task_id: &str) -> Option<&DownloadTask> {
        self.locate(task_id).map(|(j, t)| &self.jobs[j].tasks[t])
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut DownloadTask> {
        let (j, t) = self.locate(task_id)?;
        let job_id = self.jobs[j].id.clone();
        self.dirty.insert(job_id);
        Some(&mut self.jobs[j].tasks[t])
    }

    /// The task, if `generation` is the worker currently registered for it.
    fn running_task_mut(&mut self, task_id: &str, generation: u64) -> Option<&mut DownloadTask> {
        let current = self.running.get(task_id).map(|r| r.generation);
        if current != Some(generation) {
            return None;
        }
        self.task_mut(task_id)
    }

    fn mark_dirty(&mut self, job_id: &str) {
        self.dirty.insert(job_id.to_string());
    }

    /// Number of tasks currently in `Downloading`. Never above the number of
    /// live workers.
    pub fn downloading_count(&self) -> usize {
        self.jobs
            .iter()
            .flat_map(|j| j.tasks.iter())
            .filter(|t| t.status == TaskStatus::Downloading)
            .count()
    }
}

struct Inner {
    state: RwLock<RegistryState>,
    admission: Notify,
    persist: Notify,
}

/// Cheap to clone handle onto the shared registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(RegistryState::default()),
                admission: Notify::new(),
                persist: Notify::new(),
            }),
        }
    }

    /// Rebuilds the registry from persisted jobs. Downloads interrupted by a
    /// restart or shutdown come back paused, or queued when `resume_on_startup`
    /// is set. Tasks the user paused stay paused either way.
    pub fn restore(mut jobs: Vec<DownloadJob>, resume_on_startup: bool) -> Self {
        jobs.sort_by_key(|j| j.seq);
        jobs.retain(|j| !j.tasks.is_empty());
        let mut max_seq = 0;
        for job in &mut jobs {
            max_seq = max_seq.max(job.seq);
            job.tasks.sort_by_key(|t| t.seq);
            for task in &mut job.tasks {
                max_seq = max_seq.max(task.seq);
                let interrupted = matches!(
                    task.status,
                    TaskStatus::Downloading | TaskStatus::Paused(PauseReason::Unknown)
                );
                if interrupted {
                    task.status = if resume_on_startup {
                        TaskStatus::Pending
                    } else {
                        TaskStatus::Paused(PauseReason::Unknown)
                    };
                }
            }
        }
        let registry = Self::new();
        {
            let mut state = registry.write();
            state.jobs = jobs;
            state.next_seq = max_seq;
        }
        registry
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn request_admission(&self) {
        self.inner.admission.notify_one();
    }

    pub(crate) async fn admission_requested(&self) {
        self.inner.admission.notified().await
    }

    fn request_persist(&self) {
        self.inner.persist.notify_one();
    }

    pub(crate) async fn persist_requested(&self) {
        self.inner.persist.notified().await
    }

    /// All jobs, most recently created first.
    pub fn jobs(&self) -> Vec<DownloadJob> {
        self.read().jobs.iter().rev().cloned().collect()
    }

    /// A job lands in `completed` only when every task in it is `Completed`.
    pub fn buckets(&self) -> DownloadBuckets {
        let (completed, active) = self.jobs().into_iter().partition(DownloadJob::is_completed);
        DownloadBuckets { active, completed }
    }

    pub fn job(&self, job_id: &str) -> Option<DownloadJob> {
        self.read().jobs.iter().find(|j| j.id == job_id).cloned()
    }

    pub fn task(&self, task_id: &str) -> Option<DownloadTask> {
        self.read().task(task_id).cloned()
    }

    /// Creates a job and its tasks in one step. Episodes that cannot be queued
    /// are reported back; if none can, nothing is created.
    pub fn enqueue(
        &self,
        job_name: &str,
        episodes: Vec<Episode>,
        download_dir: &Path,
    ) -> Result<Enqueued, ValidationError> {
        if episodes.is_empty() {
            return Err(ValidationError {
                message: "episode list is empty".into(),
                rejected: Vec::new(),
            });
        }

        let mut state = self.write();
        let mut taken: HashSet<PathBuf> = state
            .jobs
            .iter()
            .flat_map(|j| j.tasks.iter().map(|t| t.dest_path.clone()))
            .collect();
        let queued: HashSet<u32> = state
            .jobs
            .iter()
            .filter(|j| j.name == job_name)
            .flat_map(|j| j.tasks.iter())
            .filter(|t| t.status != TaskStatus::Completed)
            .map(|t| t.episode.episode_number)
            .collect();

        let mut rejected = Vec::new();
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        for episode in episodes {
            let number = episode.episode_number;
            let reason = if episode.url.is_empty() && episode.gate_id.is_none() {
                Some("episode has neither a url nor a gate id")
            } else if queued.contains(&number) {
                Some("episode is already queued")
            } else if !seen.insert(number) {
                Some("episode is listed more than once")
            } else {
                None
            };
            match reason {
                Some(message) => rejected.push(EpisodeError {
                    episode_number: number,
                    message: message.to_string(),
                }),
                None => accepted.push(episode),
            }
        }

        if accepted.is_empty() {
            return Err(ValidationError {
                message: "no episode could be queued".into(),
                rejected,
            });
        }

        let job_seq = state.next_seq();
        let mut tasks = Vec::with_capacity(accepted.len());
        for episode in accepted {
            let base = episode_dest_path(download_dir, job_name, episode.episode_number);
            let mut dest = base.clone();
            let mut n = 2;
            while taken.contains(&dest) {
                dest = numbered_path(&base, n);
                n += 1;
            }
            taken.insert(dest.clone());
            let seq = state.next_seq();
            tasks.push(DownloadTask::new(seq, episode, dest));
        }

        let job = DownloadJob {
            id: uuid::Uuid::new_v4().to_string(),
            seq: job_seq,
            name: job_name.to_string(),
            tasks,
        };
        state.mark_dirty(&job.id);
        state.jobs.push(job.clone());
        drop(state);

        tracing::info!("queued job {} '{}' with {} task(s)", job.id, job.name, job.tasks.len());
        self.request_persist();
        self.request_admission();
        Ok(Enqueued { job, rejected })
    }

    /// Pauses pending and downloading tasks of a job, or just `task_id`.
    /// Returns how many tasks changed.
    pub fn pause(&self, job_id: &str, task_id: Option<&str>) -> usize {
        let mut state = self.write();
        let state = &mut *state;
        let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) else {
            return 0;
        };
        let mut changed = 0;
        for task in job
            .tasks
            .iter_mut()
            .filter(|t| task_id.map_or(true, |id| t.id == id))
        {
            if task.pause(PauseReason::UserRequest).is_ok() {
                if let Some(running) = state.running.get(&task.id) {
                    running.token.cancel();
                }
                changed += 1;
            }
        }
        if changed > 0 {
            state.dirty.insert(job_id.to_string());
            tracing::info!("paused {} task(s) in job {}", changed, job_id);
            self.request_persist();
        }
        changed
    }

    /// Requeues paused and failed tasks. Tasks paused on an expired link are
    /// left alone and returned, because they need a fresh link first.
    pub fn resume(&self, job_id: &str, task_id: Option<&str>) -> (Vec<String>, Vec<(String, Episode)>) {
        let mut requeued = Vec::new();
        let mut needs_link = Vec::new();
        {
            let mut state = self.write();
            let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) else {
                return (requeued, needs_link);
            };
            for task in job
                .tasks
                .iter_mut()
                .filter(|t| task_id.map_or(true, |id| t.id == id))
            {
                match task.status {
                    TaskStatus::Paused(PauseReason::LinkExpired) => {
                        needs_link.push((task.id.clone(), task.episode.clone()));
                    }
                    _ => {
                        if task.requeue().is_ok() {
                            requeued.push(task.id.clone());
                        }
                    }
                }
            }
            if !requeued.is_empty() {
                state.mark_dirty(job_id);
            }
        }
        if !requeued.is_empty() {
            tracing::info!("resumed {} task(s) in job {}", requeued.len(), job_id);
            self.request_persist();
            self.request_admission();
        }
        (requeued, needs_link)
    }

    /// Installs a freshly resolved link and requeues the task, if it is still
    /// waiting on one.
    pub fn requeue_with_link(&self, task_id: &str, url: String) -> bool {
        let requeued = {
            let mut state = self.write();
            match state.task_mut(task_id) {
                Some(task) if task.status == TaskStatus::Paused(PauseReason::LinkExpired) => {
                    task.url = url;
                    task.last_error = None;
                    task.requeue().is_ok()
                }
                _ => false,
            }
        };
        if requeued {
            self.request_persist();
            self.request_admission();
        }
        requeued
    }

    /// Records a non-fatal failure for display; status is unchanged.
    pub fn note_error(&self, task_id: &str, message: String) {
        if let Some(task) = self.write().task_mut(task_id) {
            task.last_error = Some(message);
        }
        self.request_persist();
    }

    /// Removes a task. Completed tasks and unknown ids are left alone.
    pub fn cancel(&self, task_id: &str) -> Option<RemovedTask> {
        let removed = {
            let mut state = self.write();
            let (j, t) = state.locate(task_id)?;
            if state.jobs[j].tasks[t].is_terminal() {
                return None;
            }
            let task = state.jobs[j].tasks.remove(t);
            let job_id = state.jobs[j].id.clone();
            if state.jobs[j].tasks.is_empty() {
                state.jobs.remove(j);
                state.dirty.remove(&job_id);
                state.removed.insert(job_id);
            } else {
                state.mark_dirty(&job_id);
            }
            let handle = state.running.get_mut(task_id).and_then(|running| {
                running.token.cancel();
                running.handle.take()
            });
            RemovedTask { task, handle }
        };
        tracing::info!("cancelled task {}", task_id);
        self.request_persist();
        self.request_admission();
        Some(removed)
    }

    /// Removes a job with every task in it.
    pub fn remove_job(&self, job_id: &str) -> Vec<RemovedTask> {
        let removed: Vec<RemovedTask> = {
            let mut state = self.write();
            let Some(pos) = state.jobs.iter().position(|j| j.id == job_id) else {
                return Vec::new();
            };
            let job = state.jobs.remove(pos);
            state.dirty.remove(job_id);
            state.removed.insert(job_id.to_string());
            job.tasks
                .into_iter()
                .map(|task| {
                    let handle = state.running.get_mut(&task.id).and_then(|running| {
                        running.token.cancel();
                        running.handle.take()
                    });
                    RemovedTask { task, handle }
                })
                .collect()
        };
        tracing::info!("removed job {} ({} task(s))", job_id, removed.len());
        self.request_persist();
        self.request_admission();
        removed
    }

    /// Forgets every completed job. Files stay on disk.
    pub fn clear_completed(&self) -> usize {
        let cleared = {
            let mut state = self.write();
            let (done, keep): (Vec<_>, Vec<_>) =
                std::mem::take(&mut state.jobs).into_iter().partition(DownloadJob::is_completed);
            state.jobs = keep;
            for job in &done {
                state.dirty.remove(&job.id);
                state.removed.insert(job.id.clone());
            }
            done.len()
        };
        if cleared > 0 {
            self.request_persist();
        }
        cleared
    }

    /// Stores the link a worker resolved for a task that had none.
    pub fn set_link(&self, task_id: &str, generation: u64, url: String) -> bool {
        match self.write().running_task_mut(task_id, generation) {
            Some(task) => {
                task.url = url;
                true
            }
            None => false,
        }
    }

    /// Turns a probe result into the segment plan for this attempt.
    pub fn apply_probe(
        &self,
        task_id: &str,
        generation: u64,
        remote: RemoteFile,
        segments_per_file: usize,
    ) -> Result<TaskPlan, PlanError> {
        let mut state = self.write();
        let task = state
            .running_task_mut(task_id, generation)
            .ok_or(PlanError::Stale)?;

        let accepts_ranges = remote.accepts_ranges && !task.ranges_ignored;
        if task.progress_bytes > 0 {
            let plan_still_valid = accepts_ranges
                && task.accepts_ranges
                && remote.total_bytes == Some(task.total_bytes)
                && !task.segments.is_empty();
            if !plan_still_valid {
                task.accepts_ranges = false;
                return Err(PlanError::Conflict);
            }
        } else {
            task.total_bytes = remote.total_bytes.unwrap_or(0);
            task.accepts_ranges = accepts_ranges;
            task.segments = match (accepts_ranges, remote.total_bytes) {
                (_, Some(0)) => Vec::new(),
                (true, Some(total)) => create_segments(total, segments_per_file),
                (_, total) => vec![Segment::whole(total)],
            };
        }

        Ok(TaskPlan {
            segments: task.segments.clone(),
            total_bytes: (task.total_bytes > 0 || task.segments.is_empty())
                .then_some(task.total_bytes),
            accepts_ranges: task.accepts_ranges,
        })
    }

    /// Adds bytes written by one segment of the running attempt.
    pub fn record_progress(&self, task_id: &str, generation: u64, segment_index: usize, delta: u64) {
        if let Some(task) = self.write().running_task_mut(task_id, generation) {
            task.record_progress(segment_index, delta);
        }
    }

    /// Called by a worker when its attempt ends. Applies the outcome if the
    /// task is still `Downloading`, frees the admission slot, and wakes the
    /// scheduler.
    pub fn finish(&self, task_id: &str, generation: u64, outcome: TaskOutcome) {
        {
            let mut state = self.write();
            let current = state.running.get(task_id).map(|r| r.generation);
            if current != Some(generation) {
                return;
            }
            state.running.remove(task_id);
            if let Some(task) = state.task_mut(task_id) {
                if task.status == TaskStatus::Downloading {
                    let applied = match &outcome {
                        TaskOutcome::Completed => task.complete().or_else(|_| {
                            task.fail(format!(
                                "stream ended at {} of {} bytes",
                                task.progress_bytes, task.total_bytes
                            ))
                        }),
                        TaskOutcome::Paused(reason, message) => {
                            task.last_error = Some(message.clone());
                            task.pause(*reason)
                        }
                        TaskOutcome::Failed(message) => task.fail(message.clone()),
                        TaskOutcome::RangesIgnored(message) => {
                            task.accepts_ranges = false;
                            task.ranges_ignored = true;
                            task.last_error = Some(message.clone());
                            task.pause(PauseReason::NetworkError).and_then(|_| task.requeue())
                        }
                        TaskOutcome::Stopped => task.pause(PauseReason::Unknown),
                    };
                    if let Err(e) = applied {
                        tracing::error!("{}", e);
                    }
                    tracing::info!("task {} is now {}", task_id, task.status.label());
                }
            }
        }
        self.request_persist();
        self.request_admission();
    }

    pub fn take_pending_writes(&self) -> PendingWrites {
        let mut state = self.write();
        let dirty = std::mem::take(&mut state.dirty);
        let deletes = std::mem::take(&mut state.removed).into_iter().collect();
        let saves = state
            .jobs
            .iter()
            .filter(|j| dirty.contains(&j.id))
            .cloned()
            .collect();
        PendingWrites { saves, deletes }
    }

    /// Cancels every running worker, e.g. at shutdown.
    pub(crate) fn stop_all(&self) -> Vec<JoinHandle<()>> {
        let mut state = self.write();
        state
            .running
            .values_mut()
            .filter_map(|running| {
                running.token.cancel();
                running.handle.take()
            })
            .collect()
    }
}
