//! Task recovery
//!
//! A worker can receive a queue job whose id has no repository record: the
//! store was unavailable during submission and the race still allowed the
//! enqueue, or store data was lost afterwards. The recovery strategy
//! decides whether to rebuild a minimal record from the job and keep
//! processing, or to refuse the job for an operator to inspect.

use maestro_core::models::{Task, TaskMetadata, TaskStatus};
use maestro_core::{OrchestratorError, RecoveryMode};
use maestro_queue::{Job, JobState};
use maestro_state::TaskRepository;

#[derive(Clone)]
pub struct TaskRecovery {
    mode: RecoveryMode,
}

impl TaskRecovery {
    pub fn new(mode: RecoveryMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> RecoveryMode {
        self.mode
    }

    /// Synthesise a minimal task from queue-job metadata. Status comes from
    /// the queue's view of the job; everything else from the enqueued
    /// payload.
    pub fn rebuild_from_job(job: &Job, state: Option<JobState>) -> Result<Task, OrchestratorError> {
        let task_type = job
            .name
            .parse()
            .map_err(|_| OrchestratorError::Validation(format!("Unknown task type: {}", job.name)))?;

        let status = state.map(|s| s.task_status()).unwrap_or(TaskStatus::Pending);

        let mut task = Task {
            id: job.id,
            task_type,
            status,
            params: job.payload.params.clone(),
            result: None,
            error: None,
            progress: 0,
            created_at: job.enqueued_at,
            started_at: None,
            completed_at: None,
            version: 1,
            metadata: TaskMetadata {
                timeout_ms: job.timeout_ms,
                ..job.payload.metadata.clone()
            },
            tenant: job.payload.tenant.clone(),
        };

        match status {
            TaskStatus::Running => task.started_at = Some(chrono::Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout => {
                task.started_at = Some(job.enqueued_at);
                task.completed_at = Some(chrono::Utc::now());
            }
            _ => {}
        }

        Ok(task)
    }

    /// Apply the configured strategy to a job with no repository record.
    #[tracing::instrument(skip(self, job, repository), fields(job_id = %job.id))]
    pub async fn recover(
        &self,
        job: &Job,
        state: Option<JobState>,
        repository: Option<&TaskRepository>,
    ) -> Result<Task, OrchestratorError> {
        match self.mode {
            RecoveryMode::Strict => {
                tracing::error!(
                    job_id = %job.id,
                    job_name = %job.name,
                    "Queue job has no repository record; strict recovery rejects it"
                );
                Err(OrchestratorError::Desynchronisation(format!(
                    "No task record for queue job {}",
                    job.id
                )))
            }
            RecoveryMode::Rebuild => {
                let task = Self::rebuild_from_job(job, state)?;
                tracing::warn!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    status = %task.status,
                    "Task record rebuilt from queue job"
                );

                if let Some(repository) = repository {
                    // Best-effort persist: if the store is still down the
                    // rebuilt copy lives in memory and processing continues.
                    if let Err(e) = repository.save(&task).await {
                        tracing::warn!(
                            task_id = %task.id,
                            error = %e,
                            "Could not persist rebuilt task record"
                        );
                    }
                }
                Ok(task)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_queue::JobPayload;
    use maestro_state::MemoryStateBackend;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn job() -> Job {
        let id = Uuid::new_v4();
        Job::new(
            id,
            "orchestrate",
            JobPayload {
                task_id: id,
                params: serde_json::json!({"objective": "x"}),
                tenant: None,
                metadata: TaskMetadata::default(),
            },
            5,
            12_345,
        )
    }

    #[test]
    fn rebuild_maps_job_state_onto_status() {
        let j = job();
        let task = TaskRecovery::rebuild_from_job(&j, Some(JobState::Waiting)).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.id, j.id);
        assert_eq!(task.params, j.payload.params);
        assert_eq!(task.metadata.timeout_ms, 12_345);
        assert_eq!(task.created_at, j.enqueued_at);
        assert_eq!(task.version, 1);

        let task = TaskRecovery::rebuild_from_job(&j, Some(JobState::Active)).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());

        let task = TaskRecovery::rebuild_from_job(&j, None).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn rebuild_rejects_unknown_job_name() {
        let mut j = job();
        j.name = "mystery".to_string();
        let err = TaskRecovery::rebuild_from_job(&j, None).unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn rebuild_persists_to_repository() {
        let repo = TaskRepository::new(
            Arc::new(MemoryStateBackend::new()),
            Duration::from_secs(3600),
        );
        let recovery = TaskRecovery::new(RecoveryMode::Rebuild);
        let j = job();

        let task = recovery
            .recover(&j, Some(JobState::Active), Some(&repo))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        let stored = repo.find_by_id(j.id).await.unwrap().unwrap();
        assert_eq!(stored.id, j.id);
    }

    #[tokio::test]
    async fn strict_mode_raises_desynchronisation() {
        let recovery = TaskRecovery::new(RecoveryMode::Strict);
        let err = recovery.recover(&job(), None, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Desynchronisation(_)));
        assert_eq!(err.kind(), "state_desynchronisation");
    }
}
