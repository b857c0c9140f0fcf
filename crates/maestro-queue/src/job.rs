use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use maestro_core::models::{TaskMetadata, TaskStatus, TenantContext};

/// Payload enqueued alongside every job. `task_id` always equals the job id;
/// both the queue and the repository address the work by the same value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub task_id: Uuid,
    pub params: serde_json::Value,
    pub tenant: Option<TenantContext>,
    pub metadata: TaskMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Task-type tag; selects the handler at dispatch.
    pub name: String,
    pub payload: JobPayload,
    pub priority: i32,
    pub timeout_ms: u64,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        payload: JobPayload,
        priority: i32,
        timeout_ms: u64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            payload,
            priority,
            timeout_ms,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    /// Map a queue-job state onto a task status, used when a task record has
    /// to be reconstructed from the queue alone.
    pub fn task_status(&self) -> TaskStatus {
        match self {
            JobState::Waiting | JobState::Delayed => TaskStatus::Pending,
            JobState::Active => TaskStatus::Running,
            JobState::Completed => TaskStatus::Completed,
            JobState::Failed => TaskStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_maps_to_task_status() {
        assert_eq!(JobState::Waiting.task_status(), TaskStatus::Pending);
        assert_eq!(JobState::Delayed.task_status(), TaskStatus::Pending);
        assert_eq!(JobState::Active.task_status(), TaskStatus::Running);
        assert_eq!(JobState::Completed.task_status(), TaskStatus::Completed);
        assert_eq!(JobState::Failed.task_status(), TaskStatus::Failed);
    }

    #[test]
    fn job_serde_round_trip() {
        let id = Uuid::new_v4();
        let job = Job::new(
            id,
            "orchestrate",
            JobPayload {
                task_id: id,
                params: serde_json::json!({"x": 1}),
                tenant: None,
                metadata: TaskMetadata::default(),
            },
            5,
            60_000,
        );
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.name, "orchestrate");
        assert_eq!(back.payload.task_id, id);
    }
}
