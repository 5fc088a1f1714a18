// src/worker.rs

use crate::config::Settings;
use crate::downloader::{fetch_segment_with_retry, probe, FetchError, RetryPolicy, SegmentRequest};
use crate::models::{temporary_path, Episode, PauseReason, Segment};
use crate::registry::{PlanError, Registry, TaskOutcome, TaskPlan};
use crate::resolver::ResolverBridge;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Shared handles every worker needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Registry,
    pub client: Client,
    pub bridge: ResolverBridge,
}

impl WorkerContext {
    pub fn new(registry: Registry, client: Client, bridge: ResolverBridge) -> Self {
        Self {
            registry,
            client,
            bridge,
        }
    }
}

/// One admitted attempt at downloading a task.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub task_id: String,
    pub generation: u64,
    pub episode: Episode,
    pub url: String,
    pub dest_path: PathBuf,
    pub token: CancellationToken,
    /// Settings snapshot taken at admission.
    pub settings: Settings,
}

pub struct DownloadWorker;

impl DownloadWorker {
    /// Runs the assignment to an outcome and reports it. Always frees the
    /// admission slot on exit, whatever happened.
    pub async fn run(ctx: WorkerContext, assignment: Assignment) {
        tracing::debug!(
            "worker {} starting for task {}",
            assignment.generation,
            assignment.task_id
        );
        let outcome = Self::attempt(&ctx, &assignment).await;
        match &outcome {
            TaskOutcome::Completed => {
                tracing::info!("task {} finished: {}", assignment.task_id, assignment.dest_path.display())
            }
            TaskOutcome::Paused(reason, message) => {
                tracing::warn!("task {} paused ({:?}): {}", assignment.task_id, reason, message)
            }
            TaskOutcome::Failed(message) => {
                tracing::error!("task {} failed: {}", assignment.task_id, message)
            }
            TaskOutcome::RangesIgnored(message) => tracing::warn!(
                "task {}: {}; restarting as a single stream",
                assignment.task_id,
                message
            ),
            TaskOutcome::Stopped => tracing::debug!("task {} stopped", assignment.task_id),
        }
        ctx.registry
            .finish(&assignment.task_id, assignment.generation, outcome);
    }

    async fn attempt(ctx: &WorkerContext, a: &Assignment) -> TaskOutcome {
        let url = match Self::ensure_link(ctx, a).await {
            Ok(url) => url,
            Err(outcome) => return outcome,
        };

        let remote = tokio::select! {
            remote = probe(&ctx.client, &url, &a.settings.user_agent, a.settings.request_timeout()) => remote,
            _ = a.token.cancelled() => return TaskOutcome::Stopped,
        };
        let remote = match remote {
            Ok(remote) => remote,
            Err(e) => return outcome_for(e),
        };
        tracing::debug!(
            "task {}: {:?} bytes, ranges {}",
            a.task_id,
            remote.total_bytes,
            remote.accepts_ranges
        );

        let plan = match ctx.registry.apply_probe(
            &a.task_id,
            a.generation,
            remote,
            a.settings.segments_per_file,
        ) {
            Ok(plan) => plan,
            Err(PlanError::Stale) => return TaskOutcome::Stopped,
            Err(e @ PlanError::Conflict) => {
                return TaskOutcome::Paused(PauseReason::NetworkError, e.to_string())
            }
        };

        let part_path = temporary_path(&a.dest_path);
        let all_written = plan.segments.iter().all(Segment::is_complete);
        if all_written
            && !plan.segments.is_empty()
            && !fs::try_exists(&part_path).await.unwrap_or(false)
            && fs::try_exists(&a.dest_path).await.unwrap_or(false)
        {
            // An earlier attempt already moved the file into place.
            return TaskOutcome::Completed;
        }
        if let Err(e) = prepare_part_file(&part_path, &plan).await {
            return TaskOutcome::Failed(format!("could not prepare {}: {}", part_path.display(), e));
        }

        if let Err(e) = Self::fetch_all(ctx, a, &url, &part_path, &plan).await {
            return outcome_for(e);
        }

        if let (Some(total), Some(task)) = (plan.total_bytes, ctx.registry.task(&a.task_id)) {
            if task.progress_bytes < total {
                return TaskOutcome::Paused(
                    PauseReason::NetworkError,
                    format!("only {} of {} bytes arrived", task.progress_bytes, total),
                );
            }
        }
        if a.token.is_cancelled() {
            return TaskOutcome::Stopped;
        }
        if let Err(e) = fs::rename(&part_path, &a.dest_path).await {
            return TaskOutcome::Failed(format!(
                "could not move download into place at {}: {}",
                a.dest_path.display(),
                e
            ));
        }
        TaskOutcome::Completed
    }

    /// The link to download from, resolving lazily when the task has none yet.
    async fn ensure_link(ctx: &WorkerContext, a: &Assignment) -> Result<String, TaskOutcome> {
        if !a.url.is_empty() {
            return Ok(a.url.clone());
        }
        let resolved = tokio::select! {
            resolved = ctx.bridge.resolve(&a.episode) => resolved,
            _ = a.token.cancelled() => return Err(TaskOutcome::Stopped),
        };
        match resolved {
            Ok(url) => {
                if !ctx.registry.set_link(&a.task_id, a.generation, url.clone()) {
                    return Err(TaskOutcome::Stopped);
                }
                Ok(url)
            }
            Err(e) => Err(TaskOutcome::Paused(PauseReason::LinkExpired, e.to_string())),
        }
    }

    /// Fetches every unfinished segment in parallel. The first failure stops
    /// the others and is returned.
    async fn fetch_all(
        ctx: &WorkerContext,
        a: &Assignment,
        url: &str,
        part_path: &Path,
        plan: &TaskPlan,
    ) -> Result<(), FetchError> {
        let segment_token = a.token.child_token();
        let policy = RetryPolicy {
            retries: a.settings.segment_retries,
            base_delay: a.settings.retry_base_delay(),
        };
        let mut set = JoinSet::new();

        for segment in plan.segments.iter().filter(|s| !s.is_complete()) {
            let request = SegmentRequest {
                url: url.to_string(),
                path: part_path.to_path_buf(),
                offset: segment.current_pos,
                end: segment.end_byte,
                ranged: plan.accepts_ranges,
                user_agent: a.settings.user_agent.clone(),
                connect_timeout: a.settings.request_timeout(),
                read_timeout: a.settings.read_timeout(),
            };
            let client = ctx.client.clone();
            let registry = ctx.registry.clone();
            let token = segment_token.clone();
            let task_id = a.task_id.clone();
            let generation = a.generation;
            let index = segment.index;

            set.spawn(async move {
                fetch_segment_with_retry(&client, &request, policy, &token, move |delta| {
                    registry.record_progress(&task_id, generation, index, delta)
                })
                .await
            });
        }

        let mut first_error: Option<FetchError> = None;
        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok(result) => result.map(|_| ()),
                Err(e) => Err(FetchError::Network(format!("segment task panicked: {}", e))),
            };
            if let Err(e) = result {
                if first_error.is_none() {
                    segment_token.cancel();
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            // A segment stopped by its siblings reports Cancelled; the parent's
            // token tells whether the attempt itself was stopped.
            Some(FetchError::Cancelled) if !a.token.is_cancelled() => {
                Err(FetchError::Network("segment fetch interrupted".into()))
            }
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Creates or reuses the part file. Without range support the file starts
/// over; with a known size it is allocated up front.
async fn prepare_part_file(part_path: &Path, plan: &TaskPlan) -> std::io::Result<()> {
    if let Some(parent) = part_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(!plan.accepts_ranges)
        .open(part_path)
        .await?;
    if plan.accepts_ranges {
        if let Some(total) = plan.total_bytes {
            file.set_len(total).await?;
        }
    }
    Ok(())
}

/// Maps a fetch failure onto how the attempt ends.
fn outcome_for(error: FetchError) -> TaskOutcome {
    match error {
        FetchError::Cancelled => TaskOutcome::Stopped,
        e @ FetchError::RangeIgnored => TaskOutcome::RangesIgnored(e.to_string()),
        e => match e.pause_reason() {
            Some(reason) => TaskOutcome::Paused(reason, e.to_string()),
            None => TaskOutcome::Failed(e.to_string()),
        },
    }
}
