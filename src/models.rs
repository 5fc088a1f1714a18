// src/models.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// An episode handed over by the catalog backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Episode {
    /// Download link for the episode. Empty when the link still has to be resolved.
    pub url: String,
    /// Opaque token needed to re-resolve `url` once it expires.
    pub gate_id: Option<String>,
    pub episode_number: u32,
    pub name: String,
}

/// Represents the persistent state of a single download segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start_byte: u64,
    /// Inclusive end. `None` for an open-ended stream of unknown length.
    pub end_byte: Option<u64>,
    /// The current byte position of this segment's download.
    /// Initially equals `start_byte`.
    pub current_pos: u64,
}

impl Segment {
    /// A single segment covering the whole file, used when ranges are unusable.
    pub fn whole(total_bytes: Option<u64>) -> Self {
        Self {
            index: 0,
            start_byte: 0,
            end_byte: total_bytes.filter(|t| *t > 0).map(|t| t - 1),
            current_pos: 0,
        }
    }

    /// Bytes written so far.
    pub fn downloaded(&self) -> u64 {
        self.current_pos.saturating_sub(self.start_byte)
    }

    /// Returns the number of bytes remaining to be downloaded for this segment.
    pub fn remaining_bytes(&self) -> Option<u64> {
        self.end_byte
            .map(|end| (end + 1).saturating_sub(self.current_pos))
    }

    /// Checks if the segment download is complete.
    pub fn is_complete(&self) -> bool {
        matches!(self.remaining_bytes(), Some(0))
    }
}

/// Splits `total_size` bytes into at most `count` contiguous, inclusive ranges.
pub fn create_segments(total_size: u64, count: usize) -> Vec<Segment> {
    if total_size == 0 {
        return Vec::new();
    }
    let count = (count.max(1) as u64).min(total_size);
    let segment_size = total_size / count;

    (0..count)
        .map(|i| {
            let start = i * segment_size;
            let end = if i == count - 1 {
                total_size - 1
            } else {
                start + segment_size - 1
            };
            Segment {
                index: i as usize,
                start_byte: start,
                end_byte: Some(end),
                current_pos: start,
            }
        })
        .collect()
}

/// Why a task is not progressing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PauseReason {
    UserRequest,
    LinkExpired,
    NetworkError,
    Unknown,
}

/// The status of a download task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused(PauseReason),
    Completed,
    Error(String),
}

impl TaskStatus {
    /// Short label used in logs and transition errors.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused(_) => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Error(_) => "error",
        }
    }
}

/// One episode's download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    /// Registry-wide creation sequence; admission is FIFO on this value.
    pub seq: u64,
    pub episode: Episode,
    /// Currently resolved source URL.
    pub url: String,
    pub dest_path: PathBuf,
    pub status: TaskStatus,
    pub progress_bytes: u64,
    /// Zero until the first probe reports a length.
    pub total_bytes: u64,
    /// Whether the last probe saw byte-range support.
    pub accepts_ranges: bool,
    /// Set once a GET ignored a `Range` header the server advertised. Later
    /// attempts stream the whole file in one piece.
    #[serde(default)]
    pub ranges_ignored: bool,
    /// Byte-range plan of the current attempt.
    pub segments: Vec<Segment>,
    /// Most recent non-fatal failure, kept for display.
    pub last_error: Option<String>,
}

impl DownloadTask {
    pub fn new(seq: u64, episode: Episode, dest_path: PathBuf) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq,
            url: episode.url.clone(),
            episode,
            dest_path,
            status: TaskStatus::Pending,
            progress_bytes: 0,
            total_bytes: 0,
            accepts_ranges: false,
            ranges_ignored: false,
            segments: Vec::new(),
            last_error: None,
        }
    }

    /// Calculates download progress as a fraction from 0.0 to 1.0.
    pub fn progress(&self) -> f32 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.progress_bytes as f32 / self.total_bytes as f32
        }
    }

    /// Returns the path for the temporary download file.
    /// e.g., for "/path/to/Ep 01.mp4", it returns "/path/to/Ep 01.mp4.part"
    pub fn temporary_path(&self) -> PathBuf {
        temporary_path(&self.dest_path)
    }
}

pub fn temporary_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// A named group of tasks created by one "add downloads" action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub seq: u64,
    pub name: String,
    pub tasks: Vec<DownloadTask>,
}

impl DownloadJob {
    /// Active while any task is still short of `Completed`.
    pub fn is_active(&self) -> bool {
        self.tasks.iter().any(|t| t.status != TaskStatus::Completed)
    }

    pub fn is_completed(&self) -> bool {
        !self.is_active()
    }

    pub fn progress_bytes(&self) -> u64 {
        self.tasks.iter().map(|t| t.progress_bytes).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.tasks.iter().map(|t| t.total_bytes).sum()
    }
}

/// Snapshot handed to the UI, most recent job first in each bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadBuckets {
    pub active: Vec<DownloadJob>,
    pub completed: Vec<DownloadJob>,
}

/// A per-episode rejection in a batch request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpisodeError {
    pub episode_number: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartDownloadReport {
    pub job_id: Option<String>,
    pub queued: usize,
    pub task_ids: Vec<String>,
    pub errors: Vec<EpisodeError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskError {
    pub task_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeReport {
    pub requeued: Vec<String>,
    pub failed: Vec<TaskError>,
}

/// Makes a job or file name safe on every platform we ship to.
pub fn sanitize_name(name: &str) -> String {
    let cleaned = name
        .replace(':', " -")
        .replace(['<', '>', '"', '/', '\\', '|', '?', '*'], "");
    let trimmed = cleaned.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        "Untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `<dir>/<job>/<job> - Episode NN.mp4`
pub fn episode_dest_path(download_dir: &Path, job_name: &str, episode_number: u32) -> PathBuf {
    let job = sanitize_name(job_name);
    download_dir
        .join(&job)
        .join(format!("{} - Episode {:02}.mp4", job, episode_number))
}

/// `.../name (n).ext`, used to keep destinations unique.
pub fn numbered_path(path: &Path, n: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{} ({}).{}", stem, n, ext.to_string_lossy()),
        None => format!("{} ({})", stem, n),
    };
    path.with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_cover_the_file_without_gaps() {
        let segs = create_segments(1003, 4);
        assert_eq!(segs.len(), 4);
        assert_eq!(segs[0].start_byte, 0);
        assert_eq!(segs[3].end_byte, Some(1002));
        for pair in segs.windows(2) {
            assert_eq!(pair[0].end_byte.unwrap() + 1, pair[1].start_byte);
        }
        let total: u64 = segs.iter().map(|s| s.remaining_bytes().unwrap()).sum();
        assert_eq!(total, 1003);
    }

    #[test]
    fn tiny_files_get_fewer_segments() {
        assert_eq!(create_segments(3, 8).len(), 3);
        assert!(create_segments(0, 4).is_empty());
    }

    #[test]
    fn open_segment_is_never_complete() {
        let seg = Segment::whole(None);
        assert_eq!(seg.end_byte, None);
        assert!(!seg.is_complete());
        let mut known = Segment::whole(Some(10));
        known.current_pos = 10;
        assert!(known.is_complete());
        assert_eq!(known.downloaded(), 10);
    }

    #[test]
    fn dest_paths_are_sanitized() {
        let path = episode_dest_path(Path::new("/dl"), "Re:Zero?", 3);
        assert_eq!(
            path,
            PathBuf::from("/dl/Re -Zero/Re -Zero - Episode 03.mp4")
        );
        assert_eq!(
            numbered_path(&path, 2),
            PathBuf::from("/dl/Re -Zero/Re -Zero - Episode 03 (2).mp4")
        );
        assert_eq!(
            temporary_path(&path),
            PathBuf::from("/dl/Re -Zero/Re -Zero - Episode 03.mp4.part")
        );
    }

    #[test]
    fn job_is_completed_only_when_every_task_is() {
        let ep = Episode {
            url: "http://x/1".into(),
            gate_id: None,
            episode_number: 1,
            name: "one".into(),
        };
        let mut job = DownloadJob {
            id: "j".into(),
            seq: 0,
            name: "Show".into(),
            tasks: vec![
                DownloadTask::new(1, ep.clone(), PathBuf::from("a")),
                DownloadTask::new(2, ep, PathBuf::from("b")),
            ],
        };
        assert!(job.is_active());
        job.tasks[0].status = TaskStatus::Completed;
        assert!(job.is_active());
        job.tasks[1].status = TaskStatus::Completed;
        assert!(job.is_completed());
    }
}
