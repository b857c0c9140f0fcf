use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Orchestrate,
    AgentExecute,
    EmbedDocument,
    VisionAnalyze,
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskType::Orchestrate => write!(f, "orchestrate"),
            TaskType::AgentExecute => write!(f, "agent_execute"),
            TaskType::EmbedDocument => write!(f, "embed_document"),
            TaskType::VisionAnalyze => write!(f, "vision_analyze"),
        }
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrate" => Ok(TaskType::Orchestrate),
            "agent_execute" => Ok(TaskType::AgentExecute),
            "embed_document" => Ok(TaskType::EmbedDocument),
            "vision_analyze" => Ok(TaskType::VisionAnalyze),
            _ => Err(anyhow::anyhow!("Invalid task type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }

    /// Allowed lifecycle transitions. Cancellation of a pending task is a
    /// transition to `Failed`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Completed) => true,
            (TaskStatus::Running, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Timeout) => true,
            _ => false,
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Timeout => write!(f, "timeout"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "timeout" => Ok(TaskStatus::Timeout),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 3,
    #[default]
    Normal = 5,
    High = 7,
    Critical = 10,
}

impl Priority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            0..=3 => Priority::Low,
            4..=6 => Priority::Normal,
            7..=9 => Priority::High,
            _ => Priority::Critical,
        }
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority as i32
    }
}

/// Principal on whose behalf a task runs. Opaque to the core; threaded to
/// processors for downstream authorisation and rate scoping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub principal: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMetadata {
    /// Per-task execution deadline in milliseconds. The watchdog adds its
    /// grace period on top of this.
    pub timeout_ms: u64,
    pub priority: Priority,
    /// Free-form caller annotations carried alongside the task.
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            priority: Priority::Normal,
            extra: serde_json::Value::Null,
        }
    }
}

/// The central task record. The repository copy is authoritative; in-memory
/// copies are a working cache outside the commit window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub params: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonically increasing; incremented by exactly 1 on every
    /// successful repository write.
    pub version: i64,
    pub metadata: TaskMetadata,
    pub tenant: Option<TenantContext>,
}

impl Task {
    pub fn new(
        task_type: TaskType,
        params: serde_json::Value,
        metadata: TaskMetadata,
        tenant: Option<TenantContext>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            status: TaskStatus::Pending,
            params,
            result: None,
            error: None,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            version: 1,
            metadata,
            tenant,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.metadata.timeout_ms)
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, result: serde_json::Value) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.progress = 100;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.result = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_timeout(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Timeout;
        self.error = Some(error.into());
        self.result = None;
        self.completed_at = Some(Utc::now());
    }

    /// Extract the params as a typed payload struct.
    /// Returns None if deserialization fails.
    pub fn params_as<P: TaskPayload>(&self) -> Option<P> {
        serde_json::from_value(self.params.clone()).ok()
    }

    /// Extract the params as a typed payload struct, returning an error on failure.
    pub fn try_params_as<P: TaskPayload>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.params.clone())
    }

    /// Extract the result as a typed struct.
    /// Returns None if result is not set or deserialization fails.
    pub fn result_as<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        self.result
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Create params from a typed payload struct.
    pub fn params_from<P: TaskPayload>(payload: &P) -> serde_json::Value {
        serde_json::to_value(payload).unwrap_or_default()
    }
}

/// Trait for type-safe task payloads
pub trait TaskPayload: Serialize + for<'de> Deserialize<'de> {
    fn task_type() -> TaskType;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratePayload {
    pub objective: String,
    /// Agent identifiers participating in the run, in pipeline order.
    pub agents: Vec<String>,
}

impl TaskPayload for OrchestratePayload {
    fn task_type() -> TaskType {
        TaskType::Orchestrate
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutePayload {
    pub agent_id: Uuid,
    pub input: serde_json::Value,
}

impl TaskPayload for AgentExecutePayload {
    fn task_type() -> TaskType {
        TaskType::AgentExecute
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedDocumentPayload {
    pub document_id: Uuid,
    pub collection: String,
}

impl TaskPayload for EmbedDocumentPayload {
    fn task_type() -> TaskType {
        TaskType::EmbedDocument
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionAnalyzePayload {
    pub media_url: String,
    pub prompt: Option<String>,
}

impl TaskPayload for VisionAnalyzePayload {
    fn task_type() -> TaskType {
        TaskType::VisionAnalyze
    }
}

/// Response model for status queries
#[derive(Debug, Clone, Serialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type,
            status: task.status,
            progress: task.progress,
            result: task.result,
            error: task.error,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            version: task.version,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct TaskStats {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub timeout: i64,
}

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub cursor: Option<u64>,
    pub limit: Option<usize>,
}

impl Default for TaskListQuery {
    fn default() -> Self {
        Self {
            status: None,
            task_type: None,
            cursor: Some(0),
            limit: Some(50),
        }
    }
}
