//! Task repository
//!
//! Durable keyed store of task records with optimistic versioning. The
//! stored version field is authoritative: `update` is a compare-and-swap
//! against the caller's expected version, and a mismatch rejects the whole
//! write. There are no store-side locks; the commit window is short and the
//! distributed lock serialises most conflicts before they reach the CAS.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use maestro_core::models::{Task, TaskStats, TaskStatus, TaskType};

use crate::keys;
use crate::traits::{CasOutcome, StateBackend, StateError};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Task not found: {0}")]
    NotFound(Uuid),

    #[error("Version conflict: expected {expected}, stored {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<StateError> for RepositoryError {
    fn from(err: StateError) -> Self {
        RepositoryError::BackendUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

#[derive(Clone)]
pub struct TaskRepository {
    backend: Arc<dyn StateBackend>,
    ttl: Duration,
}

/// Page size used when walking the whole keyspace.
const SCAN_PAGE: usize = 100;

impl TaskRepository {
    pub fn new(backend: Arc<dyn StateBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Write a fresh record at version 1. Rejects an id that already has a
    /// live record.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn save(&self, task: &Task) -> Result<(), RepositoryError> {
        let mut record = task.clone();
        record.version = 1;
        let serialized = serde_json::to_string(&record)?;

        let written = self
            .backend
            .put_new(&keys::task_key(task.id), &serialized, self.ttl)
            .await?;

        if !written {
            let actual = self
                .backend
                .get_versioned(&keys::task_key(task.id))
                .await?
                .map(|(_, v)| v)
                .unwrap_or(0);
            return Err(RepositoryError::VersionConflict {
                expected: 1,
                actual,
            });
        }

        tracing::debug!(task_id = %task.id, task_type = %task.task_type, "Task saved");
        Ok(())
    }

    /// Fetch the full record, or `None`. The stored version field wins over
    /// whatever the serialized payload claims.
    #[tracing::instrument(skip(self))]
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, RepositoryError> {
        match self.backend.get_versioned(&keys::task_key(id)).await? {
            Some((data, version)) => {
                let mut task: Task = serde_json::from_str(&data)?;
                task.version = version;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Version-checked full-record write. On success the stored version (and
    /// the returned value) is `expected_version + 1`; on mismatch nothing is
    /// written and the conflict carries the stored version.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn update(
        &self,
        task: &Task,
        expected_version: i64,
    ) -> Result<i64, RepositoryError> {
        let mut record = task.clone();
        record.version = expected_version + 1;
        let serialized = serde_json::to_string(&record)?;

        match self
            .backend
            .compare_and_swap(&keys::task_key(task.id), expected_version, &serialized, self.ttl)
            .await?
        {
            CasOutcome::Updated { version } => {
                tracing::debug!(
                    task_id = %task.id,
                    version = version,
                    status = %task.status,
                    "Task updated"
                );
                Ok(version)
            }
            CasOutcome::VersionMismatch { actual } => {
                tracing::warn!(
                    task_id = %task.id,
                    expected = expected_version,
                    actual = actual,
                    "Version conflict on task update"
                );
                Err(RepositoryError::VersionConflict {
                    expected: expected_version,
                    actual,
                })
            }
            CasOutcome::Missing => Err(RepositoryError::NotFound(task.id)),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError> {
        let removed = self.backend.delete(&keys::task_key(id)).await?;
        if removed {
            tracing::debug!(task_id = %id, "Task deleted");
        }
        Ok(removed)
    }

    /// One page of tasks. The returned cursor is 0 when the keyspace is
    /// exhausted.
    pub async fn list(
        &self,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<Task>, u64), RepositoryError> {
        let (keys, next) = self
            .backend
            .scan(&keys::task_pattern(), cursor, limit)
            .await?;

        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((data, version)) = self.backend.get_versioned(&key).await? {
                match serde_json::from_str::<Task>(&data) {
                    Ok(mut task) => {
                        task.version = version;
                        tasks.push(task);
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Skipping undecodable task record");
                    }
                }
            }
        }
        Ok((tasks, next))
    }

    pub async fn find_by_type(
        &self,
        task_type: &TaskType,
        limit: usize,
    ) -> Result<Vec<Task>, RepositoryError> {
        self.collect(limit, |task| task.task_type == *task_type).await
    }

    pub async fn find_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, RepositoryError> {
        self.collect(limit, |task| task.status == status).await
    }

    async fn collect<F>(&self, limit: usize, keep: F) -> Result<Vec<Task>, RepositoryError>
    where
        F: Fn(&Task) -> bool,
    {
        let mut matched = Vec::new();
        let mut cursor = 0;
        loop {
            let (tasks, next) = self.list(cursor, SCAN_PAGE).await?;
            for task in tasks {
                if keep(&task) {
                    matched.push(task);
                    if matched.len() >= limit {
                        return Ok(matched);
                    }
                }
            }
            if next == 0 {
                return Ok(matched);
            }
            cursor = next;
        }
    }

    pub async fn count(&self) -> Result<u64, RepositoryError> {
        let mut total = 0u64;
        let mut cursor = 0;
        loop {
            let (keys, next) = self
                .backend
                .scan(&keys::task_pattern(), cursor, SCAN_PAGE)
                .await?;
            total += keys.len() as u64;
            if next == 0 {
                return Ok(total);
            }
            cursor = next;
        }
    }

    pub async fn stats(&self) -> Result<TaskStats, RepositoryError> {
        let mut stats = TaskStats::default();
        let mut cursor = 0;
        loop {
            let (tasks, next) = self.list(cursor, SCAN_PAGE).await?;
            for task in tasks {
                stats.total += 1;
                match task.status {
                    TaskStatus::Pending => stats.pending += 1,
                    TaskStatus::Running => stats.running += 1,
                    TaskStatus::Completed => stats.completed += 1,
                    TaskStatus::Failed => stats.failed += 1,
                    TaskStatus::Timeout => stats.timeout += 1,
                }
            }
            if next == 0 {
                return Ok(stats);
            }
            cursor = next;
        }
    }

    /// Soft garbage collector for backends without native expiry: deletes
    /// terminal tasks whose completion is older than the repository TTL.
    /// Returns the number of records removed.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<u64, RepositoryError> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(86_400));
        let horizon = chrono::Utc::now() - ttl;

        let mut removed = 0u64;
        let mut cursor = 0;
        loop {
            let (tasks, next) = self.list(cursor, SCAN_PAGE).await?;
            for task in tasks {
                let finished_at = task.completed_at.unwrap_or(task.created_at);
                if task.is_terminal() && finished_at < horizon && self.delete(task.id).await? {
                    removed += 1;
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if removed > 0 {
            tracing::info!(count = removed, "Cleaned up expired terminal tasks");
        }
        Ok(removed)
    }

    /// Extend the TTL of an active record so a long run outlives the default
    /// retention window.
    pub async fn touch(&self, id: Uuid) -> Result<bool, RepositoryError> {
        Ok(self
            .backend
            .expire(&keys::task_key(id), self.ttl)
            .await?)
    }

    /// Cheap backend probe. Never silently succeeds on a backend error.
    pub async fn health_check(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Repository health check failed");
                false
            }
        }
    }
}
