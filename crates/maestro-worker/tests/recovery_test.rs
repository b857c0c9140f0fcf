//! Recovery: queue jobs whose repository record is gone.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::*;
use maestro_core::models::{TaskMetadata, TaskStatus, TaskType};
use maestro_core::RecoveryMode;
use maestro_queue::{Job, JobPayload, JobState, WorkQueue};
use uuid::Uuid;

fn orphan_job() -> Job {
    let id = Uuid::new_v4();
    Job::new(
        id,
        "orchestrate",
        JobPayload {
            task_id: id,
            params: serde_json::json!({"x": 1}),
            tenant: None,
            metadata: TaskMetadata {
                timeout_ms: 2_000,
                ..TaskMetadata::default()
            },
        },
        5,
        2_000,
    )
}

#[tokio::test]
async fn rebuild_strategy_reconstructs_and_completes_the_task() {
    let harness = build_harness(test_config());
    harness
        .manager
        .register_processor(TaskType::Orchestrate, Arc::new(EchoProcessor))
        .await
        .unwrap();
    harness.manager.start_worker().await.unwrap();

    // A job with no repository record, as if the store lost the task after
    // submission.
    let job = orphan_job();
    let task_id = job.id;
    harness.queue.add(job).await.unwrap();

    let task = wait_for_status(
        &harness.manager,
        task_id,
        TaskStatus::Completed,
        Duration::from_secs(3),
    )
    .await;
    assert_eq!(task.result, Some(serde_json::json!("ok")));

    // A fresh record was re-created in the repository.
    let stored = harness.repository.find_by_id(task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.params, serde_json::json!({"x": 1}));
}

#[tokio::test]
async fn strict_strategy_rejects_the_job_and_leaves_no_record() {
    let config = {
        let mut config = test_config();
        config.recovery = RecoveryMode::Strict;
        config
    };
    let harness = build_harness(config);
    harness
        .manager
        .register_processor(TaskType::Orchestrate, Arc::new(EchoProcessor))
        .await
        .unwrap();
    harness.manager.start_worker().await.unwrap();

    let job = orphan_job();
    let task_id = job.id;
    harness.queue.add(job).await.unwrap();

    // The job is refused and marked failed on the queue.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if harness.queue.get_state(task_id).await.unwrap() == Some(JobState::Failed) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("orphan job was never rejected");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Strict mode never resurrects the record.
    assert!(harness.repository.find_by_id(task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn status_queries_synthesize_from_queue_job_metadata() {
    let harness = build_harness(test_config());
    harness
        .manager
        .register_processor(TaskType::Orchestrate, Arc::new(EchoProcessor))
        .await
        .unwrap();
    // Worker intentionally not started: the job stays waiting.
    let job = orphan_job();
    let task_id = job.id;
    harness.queue.add(job).await.unwrap();

    let task = harness
        .manager
        .get_task_status(task_id)
        .await
        .unwrap()
        .expect("status should be synthesized from the queue");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.params, serde_json::json!({"x": 1}));
    assert_eq!(task.metadata.timeout_ms, 2_000);

    // The synthesized record was cached back into the repository.
    assert!(harness.repository.find_by_id(task_id).await.unwrap().is_some());
}

#[tokio::test]
async fn archived_tasks_resolve_after_store_and_queue_are_gone() {
    let documents = Arc::new(MemoryDocumentStore::default());
    let harness = build_harness_with_documents(test_config(), documents.clone());
    harness
        .manager
        .register_processor(TaskType::Orchestrate, Arc::new(EchoProcessor))
        .await
        .unwrap();
    harness.manager.start_worker().await.unwrap();

    let task_id = harness
        .manager
        .create_task(
            TaskType::Orchestrate,
            serde_json::json!({}),
            maestro_worker::CreateTaskOptions::default(),
        )
        .await
        .unwrap();
    wait_for_status(
        &harness.manager,
        task_id,
        TaskStatus::Completed,
        Duration::from_secs(3),
    )
    .await;
    harness.manager.shutdown().await;

    // A later process with an empty store and queue still resolves the
    // completed task through the document collaborator.
    let restarted = rebuild_harness(
        test_config(),
        maestro_state::MemoryStateBackend::new(),
        maestro_queue::MemoryWorkQueue::new(),
        documents,
    );
    let archived = restarted
        .get_task_status(task_id)
        .await
        .unwrap()
        .expect("archived task should resolve via documents");
    assert_eq!(archived.status, TaskStatus::Completed);
}
