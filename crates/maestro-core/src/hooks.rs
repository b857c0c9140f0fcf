//! Hooks for external collaborators
//!
//! Trait interfaces that let the core forward events and archive completed
//! tasks without depending on any transport. Forwarding is best-effort by
//! contract: implementations report failures, callers log and move on.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::Task;

/// Best-effort push of lifecycle events to an external streaming collaborator.
///
/// Failures never affect core state; the caller logs and continues.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emit an event to the given room (subscribers address tasks by id).
    async fn emit(&self, room: &str, event: &str, data: &serde_json::Value) -> Result<(), String>;
}

/// Long-term archival of completed tasks and best-effort lookup by id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Archive a completed task for long-term retention.
    async fn archive_task(&self, task: &Task) -> Result<(), String>;

    /// Look up an archived task. Only completed tasks are ever archived.
    async fn fetch_task(&self, task_id: Uuid) -> Result<Option<Task>, String>;
}

/// No-op implementation for when no streaming collaborator is configured
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(
        &self,
        _room: &str,
        _event: &str,
        _data: &serde_json::Value,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// No-op implementation for when no document collaborator is configured
pub struct NoOpDocumentStore;

#[async_trait]
impl DocumentStore for NoOpDocumentStore {
    async fn archive_task(&self, _task: &Task) -> Result<(), String> {
        Ok(())
    }

    async fn fetch_task(&self, _task_id: Uuid) -> Result<Option<Task>, String> {
        Ok(None)
    }
}
