pub mod config;
pub mod downloader;
pub mod logging;
pub mod manager;
pub mod models;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod state_manager;
pub mod task;
pub mod worker;

/// Convenient re-exports of the types a front end needs.
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::models::{
        DownloadBuckets, DownloadJob, DownloadTask, Episode, PauseReason, ResumeReport,
        StartDownloadReport, TaskStatus,
    };
    pub use crate::resolver::{LinkResolver, PassthroughResolver, ResolutionError};
}
