// src/state_manager.rs

use crate::models::DownloadJob;
use crate::registry::{PendingWrites, Registry};
use rusqlite::params;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Persists download jobs to an SQLite database, one JSON row per job.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Opens (or creates) the database file and its table.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    /// An in-memory database, gone when the last clone is dropped.
    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS downloads (
                        id              TEXT PRIMARY KEY,
                        job_data        TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Saves (inserts or replaces) a job.
    pub async fn save_job(&self, job: &DownloadJob) -> Result<(), StateError> {
        let job_data = serde_json::to_string(job)?;
        let job_id = job.id.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO downloads (id, job_data) VALUES (?1, ?2)",
                    params![job_id, job_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Loads every stored job. Rows that no longer parse are skipped with a warning.
    pub async fn load_all_jobs(&self) -> Result<Vec<DownloadJob>, StateError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, job_data FROM downloads")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for (id, data) in rows {
            match serde_json::from_str::<DownloadJob>(&data) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("skipping unreadable job row {}: {}", id, e),
            }
        }
        Ok(jobs)
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<(), StateError> {
        let job_id = job_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM downloads WHERE id = ?1", params![job_id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Writes out one batch of registry changes.
    pub async fn apply(&self, writes: PendingWrites) -> Result<(), StateError> {
        for job in &writes.saves {
            self.save_job(job).await?;
        }
        for job_id in &writes.deletes {
            self.delete_job(job_id).await?;
        }
        Ok(())
    }

    /// Keeps the database in step with the registry: on every change
    /// notification, on a timer for progress, and one last time on shutdown.
    pub async fn sync_loop(self, registry: Registry, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let stopping = tokio::select! {
                _ = registry.persist_requested() => false,
                _ = ticker.tick() => false,
                _ = shutdown.cancelled() => true,
            };
            self.flush(&registry).await;
            if stopping {
                break;
            }
        }
        tracing::debug!("state sync stopped");
    }

    pub async fn flush(&self, registry: &Registry) {
        let writes = registry.take_pending_writes();
        if writes.is_empty() {
            return;
        }
        let (saves, deletes) = (writes.saves.len(), writes.deletes.len());
        match self.apply(writes).await {
            Ok(()) => tracing::debug!("persisted {} job(s), deleted {}", saves, deletes),
            Err(e) => tracing::error!("failed to persist download state: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Episode, PauseReason, TaskStatus};

    fn episode(n: u32) -> Episode {
        Episode {
            url: format!("http://host/{}.mp4", n),
            gate_id: None,
            episode_number: n,
            name: format!("Ep {}", n),
        }
    }

    #[tokio::test]
    async fn jobs_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state.db");
        let registry = Registry::new();
        let job = registry
            .enqueue("Show", vec![episode(1), episode(2)], dir.path())
            .unwrap()
            .job;
        registry.write().jobs[0].tasks[1].status = TaskStatus::Paused(PauseReason::LinkExpired);

        let state = StateManager::new(&db).await.unwrap();
        state.flush(&registry).await;
        drop(state);

        let state = StateManager::new(&db).await.unwrap();
        let loaded = state.load_all_jobs().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, job.id);
        assert_eq!(
            loaded[0].tasks[1].status,
            TaskStatus::Paused(PauseReason::LinkExpired)
        );
    }

    #[tokio::test]
    async fn removed_jobs_are_deleted() {
        let state = StateManager::in_memory().await.unwrap();
        let registry = Registry::new();
        let job = registry
            .enqueue("Show", vec![episode(1)], Path::new("/dl"))
            .unwrap()
            .job;
        state.flush(&registry).await;
        assert_eq!(state.load_all_jobs().await.unwrap().len(), 1);

        registry.remove_job(&job.id);
        state.flush(&registry).await;
        assert!(state.load_all_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_rows_are_skipped() {
        let state = StateManager::in_memory().await.unwrap();
        state
            .conn
            .call(|conn| {
                conn.execute(
                    "INSERT INTO downloads (id, job_data) VALUES ('bad', '{not json')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        assert!(state.load_all_jobs().await.unwrap().is_empty());
    }
}
