//! Service assembly: build a fully wired task manager from configuration.
//!
//! Queue and state backends are selected by the configured URLs; with no
//! state URL the manager runs ephemeral (per-process, non-durable). The
//! streaming and document collaborators are wired when a GraphRAG base URL
//! is configured, otherwise they are no-ops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;

use maestro_core::hooks::{DocumentStore, EventSink, NoOpDocumentStore, NoOpEventSink};
use maestro_core::Config;
use maestro_queue::{MemoryWorkQueue, RedisWorkQueue, WorkQueue};
use maestro_state::{create_state_backend, LockManager, TaskRepository};
use maestro_worker::{TaskManager, TaskManagerConfig};

use crate::streaming::GraphRagClient;

pub async fn build_task_manager(config: &Config) -> anyhow::Result<Arc<TaskManager>> {
    let queue: Arc<dyn WorkQueue> = match &config.redis_url {
        Some(url) => {
            let queue = RedisWorkQueue::new(url)
                .map_err(|e| anyhow::anyhow!("queue backend: {e}"))?;
            tracing::info!("Work queue: redis");
            Arc::new(queue)
        }
        None => {
            tracing::warn!("No REDIS_URL configured; using in-process queue (non-durable)");
            Arc::new(MemoryWorkQueue::new())
        }
    };

    let (repository, locks) = match config.state_url() {
        Some(_) => {
            let backend = create_state_backend(config)
                .map_err(|e| anyhow::anyhow!("state backend: {e}"))?;
            let repository = TaskRepository::new(
                backend.clone(),
                Duration::from_secs(config.task_ttl_secs),
            );
            (Some(repository), Some(LockManager::new(backend)))
        }
        None => (None, None),
    };

    let (event_sink, documents): (Arc<dyn EventSink>, Arc<dyn DocumentStore>) =
        match &config.graphrag_base_url {
            Some(base_url) => {
                let client = GraphRagClient::new(base_url.clone())
                    .context("building GraphRAG client")?;
                (Arc::new(client.clone()), Arc::new(client))
            }
            None => (Arc::new(NoOpEventSink), Arc::new(NoOpDocumentStore)),
        };

    Ok(TaskManager::new(
        TaskManagerConfig::from_config(config),
        repository,
        locks,
        queue,
        event_sink,
        documents,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_assembly_without_backends() {
        let config = Config::default();
        let manager = build_task_manager(&config).await.unwrap();
        assert!(!manager.is_started());
    }
}
