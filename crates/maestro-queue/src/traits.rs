//! Work queue abstraction
//!
//! Storage contract for the durable queue plus the handler trait the
//! dispatch pool routes jobs to. The Redis queue is the production
//! implementation; the in-memory queue serves single-process deployments
//! and tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::job::{Job, JobState};

/// Queue operation errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Queue backend error: {0}")]
    Backend(String),

    #[error("Queue is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Handler for jobs of one name. Returning `Err` marks the queue job failed;
/// the task-level consequences are the caller's business.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> anyhow::Result<()>;
}

/// Storage contract for the durable work queue.
///
/// Claiming (`pop_next`) atomically moves a job from waiting to active so
/// two workers never dispatch the same job.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a job. The job id doubles as the task id.
    async fn add(&self, job: Job) -> Result<(), QueueError>;

    /// Atomically claim the highest-priority waiting job, moving it to
    /// active. Returns `None` when nothing is waiting.
    async fn pop_next(&self) -> Result<Option<Job>, QueueError>;

    async fn mark_completed(&self, id: Uuid) -> Result<(), QueueError>;

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), QueueError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError>;

    async fn get_state(&self, id: Uuid) -> Result<Option<JobState>, QueueError>;

    /// Remove a job only while it is still waiting. Active or terminal jobs
    /// are untouched and `false` is returned.
    async fn remove_waiting(&self, id: Uuid) -> Result<bool, QueueError>;

    /// Waiting job ids in dispatch order; index = zero-based queue position.
    async fn waiting_ids(&self) -> Result<Vec<Uuid>, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Requeue or fail jobs that have been active longer than
    /// `lock_duration`. A job stalled more than `max_stalled` times is
    /// failed instead of requeued. Returns the jobs that were failed.
    async fn reap_stalled(
        &self,
        lock_duration: Duration,
        max_stalled: u32,
    ) -> Result<Vec<Job>, QueueError>;

    /// Liveness probe; the startup barrier requires this to succeed within a
    /// bounded timeout before the worker reports ready.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Wakeup signal fired on local `add`, so the pool does not wait out the
    /// poll interval. Polling remains the cross-process fallback.
    fn notifier(&self) -> Arc<Notify>;

    async fn close(&self) -> Result<(), QueueError>;
}
