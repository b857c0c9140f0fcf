//! State reconciliation
//!
//! Invoked when a commit fails and the in-memory task may disagree with the
//! repository. Strictly read-compare-write: the repository wins wherever it
//! has data, memory is only written back when the repository lost the
//! record entirely, and business semantics that were never written stay
//! lost.

use uuid::Uuid;

use maestro_core::models::Task;
use maestro_core::OrchestratorError;
use maestro_state::TaskRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthoritativeSource {
    Repository,
    Memory,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Memory and repository already agreed.
    NoneNeeded,
    /// Repository state replaced the divergent memory copy.
    MemoryUpdated,
    /// Memory had no copy; repository state was adopted.
    MemoryOverwritten,
    /// Repository lost the record; the memory copy was written back.
    RepositoryRestored,
    /// Neither side has the task.
    Desynchronised,
}

#[derive(Debug)]
pub struct ReconcileResult {
    pub diverged: bool,
    pub reconciled: bool,
    pub authoritative: AuthoritativeSource,
    pub action: ReconcileAction,
    /// The agreed-upon record, when one exists. Callers refresh their
    /// in-memory copy from this.
    pub task: Option<Task>,
}

#[derive(Clone)]
pub struct StateReconciler {
    repository: TaskRepository,
}

impl StateReconciler {
    pub fn new(repository: TaskRepository) -> Self {
        Self { repository }
    }

    #[tracing::instrument(skip(self, memory))]
    pub async fn reconcile(
        &self,
        task_id: Uuid,
        memory: Option<&Task>,
    ) -> Result<ReconcileResult, OrchestratorError> {
        let stored = self
            .repository
            .find_by_id(task_id)
            .await
            .map_err(|e| OrchestratorError::ServiceUnavailable(e.to_string()))?;

        match (memory, stored) {
            (Some(mem), Some(repo)) => {
                if mem.version == repo.version && mem.status == repo.status {
                    Ok(ReconcileResult {
                        diverged: false,
                        reconciled: true,
                        authoritative: AuthoritativeSource::Repository,
                        action: ReconcileAction::NoneNeeded,
                        task: Some(repo),
                    })
                } else {
                    tracing::warn!(
                        task_id = %task_id,
                        memory_version = mem.version,
                        stored_version = repo.version,
                        memory_status = %mem.status,
                        stored_status = %repo.status,
                        "Task state diverged; repository wins"
                    );
                    Ok(ReconcileResult {
                        diverged: true,
                        reconciled: true,
                        authoritative: AuthoritativeSource::Repository,
                        action: ReconcileAction::MemoryUpdated,
                        task: Some(repo),
                    })
                }
            }
            (None, Some(repo)) => Ok(ReconcileResult {
                diverged: true,
                reconciled: true,
                authoritative: AuthoritativeSource::Repository,
                action: ReconcileAction::MemoryOverwritten,
                task: Some(repo),
            }),
            (Some(mem), None) => {
                // Repository data lost. Write the working copy back so the
                // task survives; the restored record starts a fresh version
                // history.
                let mut restored = mem.clone();
                restored.version = 1;
                self.repository
                    .save(&restored)
                    .await
                    .map_err(|e| OrchestratorError::ServiceUnavailable(e.to_string()))?;
                tracing::warn!(task_id = %task_id, "Task recovered: repository record restored from memory");
                Ok(ReconcileResult {
                    diverged: true,
                    reconciled: true,
                    authoritative: AuthoritativeSource::Memory,
                    action: ReconcileAction::RepositoryRestored,
                    task: Some(restored),
                })
            }
            (None, None) => {
                tracing::error!(task_id = %task_id, "Task state desynchronised: no copy exists anywhere");
                Ok(ReconcileResult {
                    diverged: true,
                    reconciled: false,
                    authoritative: AuthoritativeSource::None,
                    action: ReconcileAction::Desynchronised,
                    task: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::models::{TaskMetadata, TaskType};
    use maestro_state::MemoryStateBackend;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (StateReconciler, TaskRepository) {
        let backend = Arc::new(MemoryStateBackend::new());
        let repository = TaskRepository::new(backend, Duration::from_secs(3600));
        (StateReconciler::new(repository.clone()), repository)
    }

    fn sample() -> Task {
        Task::new(
            TaskType::Orchestrate,
            serde_json::json!({}),
            TaskMetadata::default(),
            None,
        )
    }

    #[tokio::test]
    async fn agreement_needs_no_action() {
        let (reconciler, repo) = setup();
        let task = sample();
        repo.save(&task).await.unwrap();
        let stored = repo.find_by_id(task.id).await.unwrap().unwrap();

        let result = reconciler.reconcile(task.id, Some(&stored)).await.unwrap();
        assert!(!result.diverged);
        assert!(result.reconciled);
        assert_eq!(result.action, ReconcileAction::NoneNeeded);
    }

    #[tokio::test]
    async fn repository_wins_on_divergence() {
        let (reconciler, repo) = setup();
        let mut task = sample();
        repo.save(&task).await.unwrap();
        task.mark_running();
        repo.update(&task, 1).await.unwrap();

        // Memory still holds the stale pending copy at version 1.
        let mut stale = task.clone();
        stale.status = maestro_core::models::TaskStatus::Pending;
        stale.version = 1;

        let result = reconciler.reconcile(task.id, Some(&stale)).await.unwrap();
        assert!(result.diverged);
        assert!(result.reconciled);
        assert_eq!(result.authoritative, AuthoritativeSource::Repository);
        assert_eq!(result.action, ReconcileAction::MemoryUpdated);
        let agreed = result.task.unwrap();
        assert_eq!(agreed.version, 2);
        assert_eq!(agreed.status, maestro_core::models::TaskStatus::Running);
    }

    #[tokio::test]
    async fn missing_memory_adopts_repository() {
        let (reconciler, repo) = setup();
        let task = sample();
        repo.save(&task).await.unwrap();

        let result = reconciler.reconcile(task.id, None).await.unwrap();
        assert_eq!(result.action, ReconcileAction::MemoryOverwritten);
        assert_eq!(result.task.unwrap().id, task.id);
    }

    #[tokio::test]
    async fn lost_repository_record_is_restored_from_memory() {
        let (reconciler, repo) = setup();
        let mut task = sample();
        task.mark_running();
        task.version = 5;

        let result = reconciler.reconcile(task.id, Some(&task)).await.unwrap();
        assert!(result.diverged);
        assert!(result.reconciled);
        assert_eq!(result.authoritative, AuthoritativeSource::Memory);
        assert_eq!(result.action, ReconcileAction::RepositoryRestored);

        let restored = repo.find_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(restored.status, maestro_core::models::TaskStatus::Running);
        // Restored records start a fresh version history.
        assert_eq!(restored.version, 1);
    }

    #[tokio::test]
    async fn nothing_anywhere_is_desynchronised() {
        let (reconciler, _) = setup();
        let result = reconciler
            .reconcile(uuid::Uuid::new_v4(), None)
            .await
            .unwrap();
        assert!(result.diverged);
        assert!(!result.reconciled);
        assert_eq!(result.authoritative, AuthoritativeSource::None);
        assert_eq!(result.action, ReconcileAction::Desynchronised);
        assert!(result.task.is_none());
    }
}
