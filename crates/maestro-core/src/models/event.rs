use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TaskStatus;

/// Lifecycle event kinds fanned out to subscribers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Started,
    Progress,
    Completed,
    Failed,
    ForceFailed,
    QueuePositionUpdate,
}

impl TaskEventKind {
    /// Wire name used when forwarding to the streaming collaborator.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventKind::Started => "started",
            TaskEventKind::Progress => "progress",
            TaskEventKind::Completed => "completed",
            TaskEventKind::Failed => "failed",
            TaskEventKind::ForceFailed => "forceFailed",
            TaskEventKind::QueuePositionUpdate => "queue:position-update",
        }
    }
}

/// A single per-task lifecycle event. Subscribers address tasks by `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: Uuid,
    pub kind: TaskEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error taxonomy kind, present on failure events so downstream
    /// consumers can branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    fn base(task_id: Uuid, kind: TaskEventKind) -> Self {
        Self {
            task_id,
            kind,
            status: None,
            progress: None,
            result: None,
            error: None,
            error_kind: None,
            position: None,
            estimated_wait_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub fn started(task_id: Uuid) -> Self {
        Self {
            status: Some(TaskStatus::Running),
            ..Self::base(task_id, TaskEventKind::Started)
        }
    }

    pub fn progress(task_id: Uuid, progress: u8) -> Self {
        Self {
            status: Some(TaskStatus::Running),
            progress: Some(progress),
            ..Self::base(task_id, TaskEventKind::Progress)
        }
    }

    pub fn completed(task_id: Uuid, result: serde_json::Value) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            progress: Some(100),
            result: Some(result),
            ..Self::base(task_id, TaskEventKind::Completed)
        }
    }

    pub fn failed(
        task_id: Uuid,
        status: TaskStatus,
        error: impl Into<String>,
        error_kind: impl Into<String>,
    ) -> Self {
        Self {
            status: Some(status),
            error: Some(error.into()),
            error_kind: Some(error_kind.into()),
            ..Self::base(task_id, TaskEventKind::Failed)
        }
    }

    pub fn force_failed(task_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error: Some(reason.into()),
            error_kind: Some("timeout".to_string()),
            ..Self::base(task_id, TaskEventKind::ForceFailed)
        }
    }

    pub fn queue_position(task_id: Uuid, position: i64, estimated_wait_ms: u64) -> Self {
        Self {
            position: Some(position),
            estimated_wait_ms: Some(estimated_wait_ms),
            ..Self::base(task_id, TaskEventKind::QueuePositionUpdate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_names() {
        assert_eq!(TaskEventKind::Started.as_str(), "started");
        assert_eq!(
            TaskEventKind::QueuePositionUpdate.as_str(),
            "queue:position-update"
        );
    }

    #[test]
    fn completed_event_carries_result_and_full_progress() {
        let id = Uuid::new_v4();
        let event = TaskEvent::completed(id, serde_json::json!({"answer": 42}));
        assert_eq!(event.task_id, id);
        assert_eq!(event.progress, Some(100));
        assert_eq!(event.status, Some(TaskStatus::Completed));
        assert!(event.error.is_none());
    }

    #[test]
    fn failed_event_carries_taxonomy_kind() {
        let event = TaskEvent::failed(Uuid::new_v4(), TaskStatus::Timeout, "deadline", "timeout");
        assert_eq!(event.error_kind.as_deref(), Some("timeout"));
        assert_eq!(event.status, Some(TaskStatus::Timeout));
    }

    #[test]
    fn optional_fields_are_omitted_on_the_wire() {
        let json = serde_json::to_value(TaskEvent::started(Uuid::new_v4())).unwrap();
        assert!(json.get("result").is_none());
        assert!(json.get("position").is_none());
        assert!(json.get("status").is_some());
    }
}
