//! Task processor trait and registry
//!
//! The manager routes each claimed job to the processor registered for its
//! task type. Processors receive the opaque params plus a context carrying
//! the job id, tenant, and a progress reporter.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use maestro_core::models::{TaskType, TenantContext};

/// Per-execution context handed to a processor.
pub struct ProcessorContext {
    pub job_id: Uuid,
    pub tenant: Option<TenantContext>,
    progress_tx: mpsc::Sender<u8>,
}

impl ProcessorContext {
    pub fn new(
        job_id: Uuid,
        tenant: Option<TenantContext>,
        progress_tx: mpsc::Sender<u8>,
    ) -> Self {
        Self {
            job_id,
            tenant,
            progress_tx,
        }
    }

    /// Report progress (0..100). Best-effort: a full channel drops the
    /// update rather than blocking the processor.
    pub fn report_progress(&self, progress: u8) {
        if let Err(e) = self.progress_tx.try_send(progress) {
            tracing::debug!(job_id = %self.job_id, error = %e, "Progress update dropped");
        }
    }
}

/// User-provided computation for one task type.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(
        &self,
        params: serde_json::Value,
        ctx: ProcessorContext,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Registry of processors by task type.
///
/// Thread-safe and async-compatible using tokio's RwLock; registration
/// happens at startup, reads happen on every dispatch.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: Arc<RwLock<HashMap<TaskType, Arc<dyn TaskProcessor>>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, task_type: TaskType, processor: Arc<dyn TaskProcessor>) {
        self.processors.write().await.insert(task_type, processor);
    }

    pub async fn get(&self, task_type: &TaskType) -> Option<Arc<dyn TaskProcessor>> {
        self.processors.read().await.get(task_type).cloned()
    }

    pub async fn registered_types(&self) -> Vec<TaskType> {
        self.processors.read().await.keys().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.processors.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl TaskProcessor for Echo {
        async fn process(
            &self,
            params: serde_json::Value,
            _ctx: ProcessorContext,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(params)
        }
    }

    #[tokio::test]
    async fn register_and_dispatch() {
        let registry = ProcessorRegistry::new();
        assert!(registry.is_empty().await);
        registry
            .register(TaskType::Orchestrate, Arc::new(Echo))
            .await;

        let processor = registry.get(&TaskType::Orchestrate).await.unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let ctx = ProcessorContext::new(Uuid::new_v4(), None, tx);
        let result = processor
            .process(serde_json::json!({"a": 1}), ctx)
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"a": 1}));

        assert!(registry.get(&TaskType::VisionAnalyze).await.is_none());
    }

    #[tokio::test]
    async fn progress_reports_flow_through_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let ctx = ProcessorContext::new(Uuid::new_v4(), None, tx);
        ctx.report_progress(40);
        ctx.report_progress(80);
        assert_eq!(rx.recv().await, Some(40));
        assert_eq!(rx.recv().await, Some(80));
    }
}
