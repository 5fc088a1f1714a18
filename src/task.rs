//! Download task state machine.
//!
//! ```text
//! Pending -> Downloading -> Completed
//!                        -> Paused(reason) -> Pending
//!                        -> Error(message) -> Pending
//! Pending -> Paused(UserRequest)
//! ```
//!
//! Cancellation is not a status: the registry removes the task instead.

use crate::models::{DownloadTask, PauseReason, Segment, TaskStatus};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("task {task_id}: cannot go from {from} to {to}")]
pub struct TransitionError {
    pub task_id: String,
    pub from: &'static str,
    pub to: &'static str,
}

impl DownloadTask {
    fn reject(&self, to: &'static str) -> TransitionError {
        TransitionError {
            task_id: self.id.clone(),
            from: self.status.label(),
            to,
        }
    }

    /// Only `Completed` is terminal; cancel removes tasks instead of tagging them.
    pub fn is_terminal(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self.status, TaskStatus::Paused(_) | TaskStatus::Error(_))
    }

    /// `Pending -> Downloading`.
    ///
    /// A task whose server does not accept ranges cannot continue a partial
    /// file, so its counters restart here rather than while downloading.
    pub fn admit(&mut self) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Pending {
            return Err(self.reject("downloading"));
        }
        if !self.accepts_ranges && self.progress_bytes > 0 {
            self.reset_progress();
        }
        self.status = TaskStatus::Downloading;
        Ok(())
    }

    /// `Downloading -> Completed`, only once every byte is accounted for.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Downloading {
            return Err(self.reject("completed"));
        }
        if self.total_bytes == 0 && self.segments.iter().all(|s| s.end_byte.is_none()) {
            // Unknown length: the stream closed cleanly, so what we have is the file.
            self.total_bytes = self.progress_bytes;
        }
        if self.progress_bytes != self.total_bytes {
            return Err(self.reject("completed"));
        }
        self.status = TaskStatus::Completed;
        self.last_error = None;
        Ok(())
    }

    /// `Downloading -> Paused(reason)`, or `Pending -> Paused(UserRequest)`.
    pub fn pause(&mut self, reason: PauseReason) -> Result<(), TransitionError> {
        match (&self.status, reason) {
            (TaskStatus::Downloading, _) | (TaskStatus::Pending, PauseReason::UserRequest) => {
                self.status = TaskStatus::Paused(reason);
                Ok(())
            }
            _ => Err(self.reject("paused")),
        }
    }

    /// `Downloading -> Error(message)`.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Downloading {
            return Err(self.reject("error"));
        }
        let message = message.into();
        self.last_error = Some(message.clone());
        self.status = TaskStatus::Error(message);
        Ok(())
    }

    /// `Paused | Error -> Pending`. Progress and the range plan are kept.
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        if !self.is_resumable() {
            return Err(self.reject("pending"));
        }
        self.status = TaskStatus::Pending;
        Ok(())
    }

    /// Adds `delta` bytes to one segment and refreshes the task total.
    /// Never moves a segment past its end, never lowers the counter.
    pub fn record_progress(&mut self, segment_index: usize, delta: u64) {
        let Some(segment) = self.segments.iter_mut().find(|s| s.index == segment_index) else {
            return;
        };
        let next = segment.current_pos.saturating_add(delta);
        segment.current_pos = match segment.end_byte {
            Some(end) => next.min(end + 1),
            None => next,
        };
        let sum: u64 = self.segments.iter().map(Segment::downloaded).sum();
        self.progress_bytes = self.progress_bytes.max(sum);
    }

    pub fn reset_progress(&mut self) {
        self.progress_bytes = 0;
        self.segments.clear();
    }
}
