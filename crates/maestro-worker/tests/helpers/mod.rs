//! Test helpers: build a task manager over in-memory backends.
//!
//! Run from workspace root: `cargo test -p maestro-worker`.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use maestro_core::hooks::{DocumentStore, NoOpEventSink};
use maestro_core::models::{Task, TaskStatus};
use maestro_core::RecoveryMode;
use maestro_queue::{MemoryWorkQueue, QueueWorkerConfig};
use maestro_state::{LockConfig, LockManager, MemoryStateBackend, TaskRepository};
use maestro_worker::{
    HealthThresholds, ProcessorContext, TaskManager, TaskManagerConfig, TaskProcessor,
    WatchdogConfig,
};

pub struct Harness {
    pub manager: Arc<TaskManager>,
    pub queue: MemoryWorkQueue,
    pub backend: MemoryStateBackend,
    pub repository: TaskRepository,
}

pub fn test_config() -> TaskManagerConfig {
    TaskManagerConfig {
        default_timeout: Duration::from_millis(2_000),
        max_timeout: Duration::from_secs(10),
        lock: LockConfig {
            ttl: Duration::from_secs(5),
            retry_count: 5,
            retry_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
        watchdog: WatchdogConfig {
            grace_period: Duration::from_millis(300),
            enable_force_kill: true,
        },
        queue_worker: QueueWorkerConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            ready_timeout: Duration::from_secs(1),
            ..QueueWorkerConfig::default()
        },
        health: HealthThresholds::default(),
        recovery: RecoveryMode::Rebuild,
        default_processing_ms: 1_000,
    }
}

pub fn build_harness(config: TaskManagerConfig) -> Harness {
    build_harness_with_documents(config, Arc::new(MemoryDocumentStore::default()))
}

pub fn build_harness_with_documents(
    config: TaskManagerConfig,
    documents: Arc<dyn DocumentStore>,
) -> Harness {
    let backend = MemoryStateBackend::new();
    let repository = TaskRepository::new(Arc::new(backend.clone()), Duration::from_secs(3600));
    let locks = LockManager::new(Arc::new(backend.clone()));
    let queue = MemoryWorkQueue::new();
    let manager = TaskManager::new(
        config,
        Some(repository.clone()),
        Some(locks),
        Arc::new(queue.clone()),
        Arc::new(NoOpEventSink),
        documents,
    );
    Harness {
        manager,
        queue,
        backend,
        repository,
    }
}

/// Manager with no repository or lock manager: the non-durable fast path.
pub fn build_ephemeral_manager(config: TaskManagerConfig) -> (Arc<TaskManager>, MemoryWorkQueue) {
    let queue = MemoryWorkQueue::new();
    let manager = TaskManager::new(
        config,
        None,
        None,
        Arc::new(queue.clone()),
        Arc::new(NoOpEventSink),
        Arc::new(MemoryDocumentStore::default()),
    );
    (manager, queue)
}

/// Rebuild a manager over existing backends, as a restarted process would.
pub fn rebuild_harness(
    config: TaskManagerConfig,
    backend: MemoryStateBackend,
    queue: MemoryWorkQueue,
    documents: Arc<dyn DocumentStore>,
) -> Arc<TaskManager> {
    let repository = TaskRepository::new(Arc::new(backend.clone()), Duration::from_secs(3600));
    let locks = LockManager::new(Arc::new(backend));
    TaskManager::new(
        config,
        Some(repository),
        Some(locks),
        Arc::new(queue),
        Arc::new(NoOpEventSink),
        documents,
    )
}

pub async fn wait_for_status(
    manager: &TaskManager,
    task_id: Uuid,
    status: TaskStatus,
    timeout: Duration,
) -> Task {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(task)) = manager.get_task_status(task_id).await {
            if task.status == status {
                return task;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("task {task_id} never reached {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Completes immediately with the string result "ok".
pub struct EchoProcessor;

#[async_trait]
impl TaskProcessor for EchoProcessor {
    async fn process(
        &self,
        _params: serde_json::Value,
        _ctx: ProcessorContext,
    ) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!("ok"))
    }
}

/// Cooperatively sleeps; cancelled by the task's own timeout race.
pub struct SleepProcessor {
    pub duration: Duration,
}

#[async_trait]
impl TaskProcessor for SleepProcessor {
    async fn process(
        &self,
        _params: serde_json::Value,
        _ctx: ProcessorContext,
    ) -> anyhow::Result<serde_json::Value> {
        tokio::time::sleep(self.duration).await;
        Ok(serde_json::json!("slept"))
    }
}

/// Blocks the worker thread, ignoring every async deadline. Only the
/// watchdog (running on its own task) can make the record terminal.
pub struct BlockingProcessor {
    pub duration: Duration,
}

#[async_trait]
impl TaskProcessor for BlockingProcessor {
    async fn process(
        &self,
        _params: serde_json::Value,
        _ctx: ProcessorContext,
    ) -> anyhow::Result<serde_json::Value> {
        std::thread::sleep(self.duration);
        Ok(serde_json::json!("unreachable result"))
    }
}

/// Fails with a fixed message.
pub struct FailingProcessor;

#[async_trait]
impl TaskProcessor for FailingProcessor {
    async fn process(
        &self,
        _params: serde_json::Value,
        _ctx: ProcessorContext,
    ) -> anyhow::Result<serde_json::Value> {
        Err(anyhow::anyhow!("downstream model rejected the request"))
    }
}

/// Reports progress, then finishes after a short delay so the progress
/// commit can be observed mid-run.
pub struct ProgressProcessor {
    pub progress: u8,
}

#[async_trait]
impl TaskProcessor for ProgressProcessor {
    async fn process(
        &self,
        _params: serde_json::Value,
        ctx: ProcessorContext,
    ) -> anyhow::Result<serde_json::Value> {
        ctx.report_progress(self.progress);
        tokio::time::sleep(Duration::from_millis(400)).await;
        Ok(serde_json::json!("done"))
    }
}

/// Parks until released, keeping its concurrency slot occupied.
pub struct GatedProcessor {
    pub gate: Arc<Notify>,
}

#[async_trait]
impl TaskProcessor for GatedProcessor {
    async fn process(
        &self,
        _params: serde_json::Value,
        _ctx: ProcessorContext,
    ) -> anyhow::Result<serde_json::Value> {
        self.gate.notified().await;
        Ok(serde_json::json!("released"))
    }
}

/// Document collaborator double that archives into a shared map.
#[derive(Default)]
pub struct MemoryDocumentStore {
    archived: Mutex<HashMap<Uuid, Task>>,
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn archive_task(&self, task: &Task) -> Result<(), String> {
        self.archived.lock().unwrap().insert(task.id, task.clone());
        Ok(())
    }

    async fn fetch_task(&self, task_id: Uuid) -> Result<Option<Task>, String> {
        Ok(self.archived.lock().unwrap().get(&task_id).cloned())
    }
}

impl MemoryDocumentStore {
    pub fn archived_count(&self) -> usize {
        self.archived.lock().unwrap().len()
    }
}
