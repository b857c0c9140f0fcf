//! In-memory work queue.
//!
//! Single-process twin of the Redis queue behind the same trait. Ordering
//! matches the Redis implementation: priority descending, FIFO within a
//! priority band. `set_failing` simulates a queue outage for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::job::{Job, JobState};
use crate::traits::{QueueCounts, QueueError, WorkQueue};

#[derive(Default)]
struct Inner {
    /// Waiting ids in dispatch order.
    waiting: Vec<Uuid>,
    jobs: HashMap<Uuid, Job>,
    states: HashMap<Uuid, JobState>,
    active_since: HashMap<Uuid, Instant>,
    stalled_counts: HashMap<Uuid, u32>,
    closed: bool,
}

#[derive(Clone, Default)]
pub struct MemoryWorkQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    failing: Arc<AtomicBool>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a queue outage: every subsequent call fails until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(QueueError::Backend("simulated queue outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn add(&self, job: Job) -> Result<(), QueueError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(QueueError::Closed);
        }

        // Insert after the last job of equal or higher priority so bands
        // stay FIFO.
        let position = inner
            .waiting
            .iter()
            .position(|id| {
                inner
                    .jobs
                    .get(id)
                    .is_some_and(|other| other.priority < job.priority)
            })
            .unwrap_or(inner.waiting.len());

        let id = job.id;
        inner.waiting.insert(position, id);
        inner.states.insert(id, JobState::Waiting);
        inner.jobs.insert(id, job);
        drop(inner);

        self.notify.notify_one();
        Ok(())
    }

    async fn pop_next(&self) -> Result<Option<Job>, QueueError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if inner.waiting.is_empty() {
            return Ok(None);
        }
        let id = inner.waiting.remove(0);
        inner.states.insert(id, JobState::Active);
        inner.active_since.insert(id, Instant::now());
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn mark_completed(&self, id: Uuid) -> Result<(), QueueError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.states.insert(id, JobState::Completed);
        inner.active_since.remove(&id);
        inner.stalled_counts.remove(&id);
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), QueueError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.states.insert(id, JobState::Failed);
        inner.active_since.remove(&id);
        inner.stalled_counts.remove(&id);
        tracing::debug!(job_id = %id, reason = %reason, "Job marked failed");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn get_state(&self, id: Uuid) -> Result<Option<JobState>, QueueError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.states.get(&id).copied())
    }

    async fn remove_waiting(&self, id: Uuid) -> Result<bool, QueueError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.waiting.iter().position(|other| *other == id) {
            Some(index) => {
                inner.waiting.remove(index);
                inner.jobs.remove(&id);
                inner.states.remove(&id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn waiting_ids(&self) -> Result<Vec<Uuid>, QueueError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.waiting.clone())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut counts = QueueCounts::default();
        for state in inner.states.values() {
            match state {
                JobState::Waiting | JobState::Delayed => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn reap_stalled(
        &self,
        lock_duration: Duration,
        max_stalled: u32,
    ) -> Result<Vec<Job>, QueueError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let stalled: Vec<Uuid> = inner
            .active_since
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= lock_duration)
            .map(|(id, _)| *id)
            .collect();

        let mut failed = Vec::new();
        for id in stalled {
            let count = inner.stalled_counts.entry(id).or_insert(0);
            *count += 1;
            if *count > max_stalled {
                inner.states.insert(id, JobState::Failed);
                inner.active_since.remove(&id);
                if let Some(job) = inner.jobs.get(&id) {
                    failed.push(job.clone());
                }
                tracing::warn!(job_id = %id, "Stalled job exceeded max stalls, failing");
            } else {
                inner.states.insert(id, JobState::Waiting);
                inner.active_since.remove(&id);
                inner.waiting.insert(0, id);
                tracing::warn!(job_id = %id, "Requeued stalled job");
            }
        }
        Ok(failed)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        if inner.closed {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    async fn close(&self) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        Ok(())
    }
}
