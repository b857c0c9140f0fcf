//! Ephemeral mode: no repository, per-task in-process mutex, non-durable.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::*;
use maestro_core::models::{TaskStatus, TaskType};
use maestro_worker::CreateTaskOptions;

#[tokio::test]
async fn tasks_complete_without_a_repository() {
    let (manager, _queue) = build_ephemeral_manager(test_config());
    manager
        .register_processor(TaskType::Orchestrate, Arc::new(EchoProcessor))
        .await
        .unwrap();
    manager.start_worker().await.unwrap();

    let task_id = manager
        .create_task(
            TaskType::Orchestrate,
            serde_json::json!({"x": 1}),
            CreateTaskOptions::default(),
        )
        .await
        .unwrap();

    let task = wait_for_status(
        &manager,
        task_id,
        TaskStatus::Completed,
        Duration::from_secs(3),
    )
    .await;
    assert_eq!(task.result, Some(serde_json::json!("ok")));
    assert_eq!(task.progress, 100);
    // Versions still move on every in-memory commit.
    assert!(task.version >= 3);
}

#[tokio::test]
async fn progress_commits_serialize_on_the_task_mutex() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let (manager, _queue) = build_ephemeral_manager(test_config());
    manager
        .register_processor(
            TaskType::Orchestrate,
            Arc::new(GatedProcessor { gate: gate.clone() }),
        )
        .await
        .unwrap();
    manager.start_worker().await.unwrap();

    let task_id = manager
        .create_task(
            TaskType::Orchestrate,
            serde_json::json!({}),
            CreateTaskOptions::default(),
        )
        .await
        .unwrap();
    let running = wait_for_status(
        &manager,
        task_id,
        TaskStatus::Running,
        Duration::from_secs(3),
    )
    .await;

    let (a, b) = tokio::join!(
        manager.update_progress(task_id, 30),
        manager.update_progress(task_id, 60),
    );
    a.unwrap();
    b.unwrap();

    let after = manager.get_task_status(task_id).await.unwrap().unwrap();
    assert_eq!(after.version, running.version + 2);

    gate.notify_one();
    wait_for_status(
        &manager,
        task_id,
        TaskStatus::Completed,
        Duration::from_secs(3),
    )
    .await;
}

#[tokio::test]
async fn stats_come_from_the_memory_map() {
    let (manager, _queue) = build_ephemeral_manager(test_config());
    manager
        .register_processor(TaskType::Orchestrate, Arc::new(EchoProcessor))
        .await
        .unwrap();
    manager.start_worker().await.unwrap();

    let task_id = manager
        .create_task(
            TaskType::Orchestrate,
            serde_json::json!({}),
            CreateTaskOptions::default(),
        )
        .await
        .unwrap();
    wait_for_status(
        &manager,
        task_id,
        TaskStatus::Completed,
        Duration::from_secs(3),
    )
    .await;

    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.completed, 1);
}
