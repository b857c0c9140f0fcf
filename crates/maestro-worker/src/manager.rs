//! Task manager: submission, dispatch, and lifecycle.
//!
//! The repository copy of a task is authoritative; the manager's in-memory
//! map is a working cache that is only trusted inside the commit window.
//! Every state transition runs as a two-phase commit: prepare (repository
//! health check + distributed lock on `task-state:{id}`), commit
//! (version-checked write, reconciling on conflict), cleanup (lock release
//! on every exit path). With no repository configured the manager degrades
//! to a keyed in-process mutex per task; that mode is not durable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use uuid::Uuid;

use maestro_core::hooks::{DocumentStore, EventSink};
use maestro_core::models::{
    Priority, Task, TaskEvent, TaskMetadata, TaskStats, TaskStatus, TaskType, TenantContext,
};
use maestro_core::{Config, OrchestratorError, RecoveryMode};
use maestro_queue::{
    Job, JobHandler, JobPayload, QueueCounts, QueueError, QueueWorker, QueueWorkerConfig, WorkQueue,
};
use maestro_state::{keys, LockConfig, LockManager, RepositoryError, TaskRepository};

use crate::events::EventHub;
use crate::health::{HealthSnapshot, HealthThresholds, WorkerHealthMonitor};
use crate::processor::{ProcessorContext, ProcessorRegistry, TaskProcessor};
use crate::recovery::TaskRecovery;
use crate::watchdog::{ForceFailHandler, Watchdog, WatchdogConfig, WatchdogMetrics};
use crate::StateReconciler;

/// Bounded retries after a version conflict has been reconciled.
const COMMIT_RETRIES: u32 = 2;

#[derive(Clone)]
pub struct TaskManagerConfig {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub lock: LockConfig,
    pub watchdog: WatchdogConfig,
    pub queue_worker: QueueWorkerConfig,
    pub health: HealthThresholds,
    pub recovery: RecoveryMode,
    /// Fallback per-task processing estimate until completions provide a
    /// running mean.
    pub default_processing_ms: u64,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            max_timeout: Duration::from_secs(600),
            lock: LockConfig::default(),
            watchdog: WatchdogConfig::default(),
            queue_worker: QueueWorkerConfig::default(),
            health: HealthThresholds::default(),
            recovery: RecoveryMode::Rebuild,
            default_processing_ms: 30_000,
        }
    }
}

impl TaskManagerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_timeout: Duration::from_millis(config.default_task_timeout_ms),
            max_timeout: Duration::from_millis(config.max_task_timeout_ms),
            lock: LockConfig {
                ttl: Duration::from_millis(config.lock_ttl_ms),
                retry_count: config.lock_retry_count,
                retry_delay: Duration::from_millis(config.lock_retry_delay_ms),
                backoff_multiplier: config.lock_backoff_multiplier,
            },
            watchdog: WatchdogConfig {
                grace_period: Duration::from_millis(config.watchdog_grace_period_ms),
                enable_force_kill: true,
            },
            queue_worker: QueueWorkerConfig {
                concurrency: config.worker_concurrency,
                poll_interval: Duration::from_millis(config.queue_poll_interval_ms),
                stalled_check_interval: Duration::from_millis(config.stalled_check_interval_ms),
                job_lock_duration: Duration::from_millis(config.job_lock_duration_ms),
                max_stalled_count: config.max_stalled_count,
                ready_timeout: Duration::from_millis(config.queue_ready_timeout_ms),
            },
            health: HealthThresholds::default(),
            recovery: config.recovery_strategy,
            default_processing_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    pub timeout_ms: Option<u64>,
    pub priority: Priority,
    /// Free-form caller annotations stored on the task metadata.
    pub metadata: serde_json::Value,
    pub tenant: Option<TenantContext>,
}

#[derive(Debug, Default)]
struct RunningMean {
    count: u64,
    mean_ms: f64,
}

impl RunningMean {
    fn record(&mut self, ms: f64) {
        self.count += 1;
        self.mean_ms += (ms - self.mean_ms) / self.count as f64;
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean_ms)
    }
}

pub struct TaskManager {
    config: TaskManagerConfig,
    repository: Option<TaskRepository>,
    locks: Option<LockManager>,
    reconciler: Option<StateReconciler>,
    recovery: TaskRecovery,
    queue: Arc<dyn WorkQueue>,
    worker: QueueWorker,
    registry: ProcessorRegistry,
    events: EventHub,
    event_sink: Arc<dyn EventSink>,
    documents: Arc<dyn DocumentStore>,
    health: Arc<WorkerHealthMonitor>,
    watchdog: Arc<Watchdog>,
    /// Working cache; authoritative only inside a commit window.
    tasks: RwLock<HashMap<Uuid, Task>>,
    /// Ephemeral-mode replacement for the distributed lock: one mutex per
    /// task id.
    local_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    avg_processing: std::sync::Mutex<RunningMean>,
    shutdown_signals: Mutex<Vec<mpsc::Sender<()>>>,
    started: AtomicBool,
}

impl TaskManager {
    pub fn new(
        config: TaskManagerConfig,
        repository: Option<TaskRepository>,
        locks: Option<LockManager>,
        queue: Arc<dyn WorkQueue>,
        event_sink: Arc<dyn EventSink>,
        documents: Arc<dyn DocumentStore>,
    ) -> Arc<Self> {
        let worker = QueueWorker::new(queue.clone(), config.queue_worker.clone());
        let watchdog = Arc::new(Watchdog::new(config.watchdog.clone()));
        let health = Arc::new(WorkerHealthMonitor::new(config.health.clone()));
        let reconciler = repository.as_ref().map(|r| StateReconciler::new(r.clone()));
        let recovery = TaskRecovery::new(config.recovery);

        if repository.is_none() {
            tracing::warn!("Task manager running without a repository; tasks are not durable");
        }

        Arc::new(Self {
            config,
            repository,
            locks,
            reconciler,
            recovery,
            queue,
            worker,
            registry: ProcessorRegistry::new(),
            events: EventHub::default(),
            event_sink,
            documents,
            health,
            watchdog,
            tasks: RwLock::new(HashMap::new()),
            local_locks: Mutex::new(HashMap::new()),
            avg_processing: std::sync::Mutex::new(RunningMean::default()),
            shutdown_signals: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn health(&self) -> &Arc<WorkerHealthMonitor> {
        &self.health
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub fn watchdog_metrics(&self) -> WatchdogMetrics {
        self.watchdog.metrics()
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, OrchestratorError> {
        self.queue
            .counts()
            .await
            .map_err(|e| OrchestratorError::ServiceUnavailable(e.to_string()))
    }

    /// Register the processor for one task type. All registrations must
    /// happen before [`start_worker`](Self::start_worker).
    pub async fn register_processor(
        &self,
        task_type: TaskType,
        processor: Arc<dyn TaskProcessor>,
    ) -> Result<(), OrchestratorError> {
        if self.is_started() {
            return Err(OrchestratorError::InvalidTransition(
                "Processors must be registered before the worker starts".to_string(),
            ));
        }
        self.registry.register(task_type, processor).await;
        Ok(())
    }

    /// Bind a queue handler per registered task type and start the dispatch
    /// pool. Fails loudly when the queue is not observably live within the
    /// startup window.
    pub async fn start_worker(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        if self.is_started() {
            return Err(OrchestratorError::InvalidTransition(
                "Worker already started".to_string(),
            ));
        }
        if self.registry.is_empty().await {
            tracing::warn!("Starting worker with no registered processors");
        }

        let as_handler: Arc<dyn ForceFailHandler> = self.clone();
        self.watchdog
            .set_force_fail_handler(Arc::downgrade(&as_handler));

        for task_type in self.registry.registered_types().await {
            self.worker
                .register_handler(
                    task_type.to_string(),
                    Arc::new(TaskJobHandler {
                        manager: Arc::downgrade(self),
                    }),
                )
                .await
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        }

        self.worker.start().await.map_err(|e| match e {
            QueueError::Connection(msg) => OrchestratorError::ServiceUnavailable(msg),
            other => OrchestratorError::ServiceUnavailable(other.to_string()),
        })?;

        let tick_shutdown = self.health.start_tick();
        let forwarder_shutdown = self.events.spawn_forwarder(self.event_sink.clone());
        self.shutdown_signals
            .lock()
            .await
            .extend([tick_shutdown, forwarder_shutdown]);

        self.started.store(true, Ordering::SeqCst);
        tracing::info!("Task manager started");
        Ok(())
    }

    /// Submission. The repository is the sequence point: no job is enqueued
    /// unless the record is verifiably persisted, and an enqueue failure
    /// rolls the record back.
    #[tracing::instrument(skip(self, params, options))]
    pub async fn create_task(
        &self,
        task_type: TaskType,
        params: serde_json::Value,
        options: CreateTaskOptions,
    ) -> Result<Uuid, OrchestratorError> {
        if !self.is_started() {
            return Err(OrchestratorError::ServiceUnavailable(
                "Worker has not been started".to_string(),
            ));
        }
        if !params.is_object() {
            return Err(OrchestratorError::Validation(
                "Task params must be a JSON object".to_string(),
            ));
        }

        let timeout_ms = options
            .timeout_ms
            .unwrap_or(self.config.default_timeout.as_millis() as u64)
            .min(self.config.max_timeout.as_millis() as u64);

        let metadata = TaskMetadata {
            timeout_ms,
            priority: options.priority,
            extra: options.metadata,
        };
        let task = Task::new(task_type.clone(), params, metadata, options.tenant);
        let task_id = task.id;

        self.tasks.write().await.insert(task_id, task.clone());

        if let Some(repository) = &self.repository {
            if let Err(e) = repository.save(&task).await {
                self.tasks.write().await.remove(&task_id);
                return Err(repo_err(e));
            }

            // Read-after-write verify: the record must be observable before
            // any worker could dequeue the job.
            match repository.find_by_id(task_id).await {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    self.tasks.write().await.remove(&task_id);
                    let _ = repository.delete(task_id).await;
                    return Err(OrchestratorError::ServiceUnavailable(
                        "Task persistence could not be verified".to_string(),
                    ));
                }
            }
        }

        let job = Job::new(
            task_id,
            task.task_type.to_string(),
            JobPayload {
                task_id,
                params: task.params.clone(),
                tenant: task.tenant.clone(),
                metadata: task.metadata.clone(),
            },
            task.metadata.priority.as_i32(),
            timeout_ms,
        );

        if let Err(e) = self.queue.add(job).await {
            self.tasks.write().await.remove(&task_id);
            if let Some(repository) = &self.repository {
                if let Err(delete_err) = repository.delete(task_id).await {
                    tracing::error!(
                        task_id = %task_id,
                        error = %delete_err,
                        "Rollback delete failed after enqueue error"
                    );
                }
            }
            return Err(OrchestratorError::ServiceUnavailable(format!(
                "Failed to enqueue task: {e}"
            )));
        }

        tracing::info!(
            task_id = %task_id,
            task_type = %task_type,
            timeout_ms = timeout_ms,
            priority = task.metadata.priority.as_i32(),
            "Task submitted"
        );
        Ok(task_id)
    }

    /// Status resolution chain: repository, then queue-job synthesis, then
    /// the long-term document collaborator.
    pub async fn get_task_status(
        &self,
        task_id: Uuid,
    ) -> Result<Option<Task>, OrchestratorError> {
        if let Some(repository) = &self.repository {
            match repository.find_by_id(task_id).await {
                Ok(Some(task)) => {
                    self.tasks.write().await.insert(task_id, task.clone());
                    return Ok(Some(task));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Repository status lookup failed");
                }
            }
        } else if let Some(task) = self.tasks.read().await.get(&task_id) {
            return Ok(Some(task.clone()));
        }

        if let Ok(Some(job)) = self.queue.get_job(task_id).await {
            let state = self.queue.get_state(task_id).await.ok().flatten();
            if let Ok(task) = TaskRecovery::rebuild_from_job(&job, state) {
                tracing::debug!(task_id = %task_id, "Task status synthesized from queue job");
                self.tasks.write().await.insert(task_id, task.clone());
                if let Some(repository) = &self.repository {
                    if let Err(e) = repository.save(&task).await {
                        tracing::debug!(task_id = %task_id, error = %e, "Could not cache synthesized task");
                    }
                }
                return Ok(Some(task));
            }
        }

        match self.documents.fetch_task(task_id).await {
            Ok(Some(task)) => return Ok(Some(task)),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(task_id = %task_id, error = %e, "Document collaborator lookup failed");
            }
        }

        Ok(None)
    }

    /// Cancellation is cooperative: only pending tasks can be removed. The
    /// record transitions to failed with a cancellation reason.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool, OrchestratorError> {
        let removed = match self.queue.remove_waiting(task_id).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Queue removal failed during cancel");
                false
            }
        };

        let task = self
            .commit_transition(task_id, |task| {
                if task.status != TaskStatus::Pending {
                    return Err(OrchestratorError::InvalidTransition(format!(
                        "Only pending tasks can be cancelled; task is {}",
                        task.status
                    )));
                }
                task.mark_failed("Task cancelled by request");
                Ok(())
            })
            .await?;

        self.events.publish(TaskEvent::failed(
            task_id,
            task.status,
            "Task cancelled by request",
            "operation",
        ));
        self.broadcast_queue_positions().await;
        tracing::info!(task_id = %task_id, queue_removed = removed, "Task cancelled");
        Ok(true)
    }

    /// Force the record terminal regardless of pending/running state. Used
    /// by the watchdog; a no-op on already-terminal tasks.
    #[tracing::instrument(skip(self))]
    pub async fn force_fail(
        &self,
        task_id: Uuid,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let removed = self.queue.remove_waiting(task_id).await.unwrap_or(false);
        if !removed {
            if let Err(e) = self.queue.mark_failed(task_id, reason).await {
                tracing::debug!(task_id = %task_id, error = %e, "Queue mark-failed during force-fail");
            }
        }

        let reason_owned = reason.to_string();
        let result = self
            .commit_transition(task_id, move |task| {
                if task.is_terminal() {
                    return Err(OrchestratorError::InvalidTransition(
                        "Task already terminal".to_string(),
                    ));
                }
                task.mark_failed(reason_owned.clone());
                Ok(())
            })
            .await;

        match result {
            Ok(_) => {
                tracing::warn!(task_id = %task_id, reason = %reason, "Task force-failed");
                self.events
                    .publish(TaskEvent::force_failed(task_id, reason));
                self.broadcast_queue_positions().await;
                Ok(())
            }
            // Terminal states never transition; a late force-fail is a no-op.
            Err(OrchestratorError::InvalidTransition(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Zero-based position among waiting jobs, or -1 when not waiting.
    pub async fn get_queue_position(&self, task_id: Uuid) -> Result<i64, OrchestratorError> {
        let waiting = self
            .queue
            .waiting_ids()
            .await
            .map_err(|e| OrchestratorError::ServiceUnavailable(e.to_string()))?;
        Ok(waiting
            .iter()
            .position(|id| *id == task_id)
            .map(|p| p as i64)
            .unwrap_or(-1))
    }

    /// Position times the running mean of recent completed-job processing
    /// times, falling back to a configured default with no history.
    pub async fn estimated_wait_time(
        &self,
        task_id: Uuid,
    ) -> Result<Option<Duration>, OrchestratorError> {
        let position = self.get_queue_position(task_id).await?;
        if position < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(
            (position as f64 * self.mean_processing_ms()) as u64,
        )))
    }

    pub async fn stats(&self) -> Result<TaskStats, OrchestratorError> {
        match &self.repository {
            Some(repository) => repository.stats().await.map_err(repo_err),
            None => {
                let tasks = self.tasks.read().await;
                let mut stats = TaskStats::default();
                for task in tasks.values() {
                    stats.total += 1;
                    match task.status {
                        TaskStatus::Pending => stats.pending += 1,
                        TaskStatus::Running => stats.running += 1,
                        TaskStatus::Completed => stats.completed += 1,
                        TaskStatus::Failed => stats.failed += 1,
                        TaskStatus::Timeout => stats.timeout += 1,
                    }
                }
                Ok(stats)
            }
        }
    }

    pub async fn list_tasks(
        &self,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<Task>, u64), OrchestratorError> {
        match &self.repository {
            Some(repository) => repository.list(cursor, limit).await.map_err(repo_err),
            None => {
                let tasks = self.tasks.read().await;
                let mut all: Vec<Task> = tasks.values().cloned().collect();
                all.sort_by_key(|t| t.created_at);
                let start = (cursor as usize).min(all.len());
                let end = (start + limit).min(all.len());
                let next = if end >= all.len() { 0 } else { end as u64 };
                Ok((all[start..end].to_vec(), next))
            }
        }
    }

    pub async fn find_tasks_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, OrchestratorError> {
        match &self.repository {
            Some(repository) => repository
                .find_by_status(status, limit)
                .await
                .map_err(repo_err),
            None => {
                let tasks = self.tasks.read().await;
                Ok(tasks
                    .values()
                    .filter(|t| t.status == status)
                    .take(limit)
                    .cloned()
                    .collect())
            }
        }
    }

    pub async fn find_tasks_by_type(
        &self,
        task_type: &TaskType,
        limit: usize,
    ) -> Result<Vec<Task>, OrchestratorError> {
        match &self.repository {
            Some(repository) => repository
                .find_by_type(task_type, limit)
                .await
                .map_err(repo_err),
            None => {
                let tasks = self.tasks.read().await;
                Ok(tasks
                    .values()
                    .filter(|t| t.task_type == *task_type)
                    .take(limit)
                    .cloned()
                    .collect())
            }
        }
    }

    /// Stop claiming work, stop the background loops, and close the queue.
    /// In-flight handlers run to their deadlines.
    pub async fn shutdown(&self) {
        tracing::info!("Task manager shutting down");
        self.worker.shutdown().await;
        for tx in self.shutdown_signals.lock().await.drain(..) {
            let _ = tx.send(()).await;
        }
        if let Err(e) = self.queue.close().await {
            tracing::warn!(error = %e, "Queue close failed during shutdown");
        }
        self.started.store(false, Ordering::SeqCst);
    }

    // ---- internal ----

    fn mean_processing_ms(&self) -> f64 {
        self.avg_processing
            .lock()
            .expect("processing mean lock poisoned")
            .mean()
            .unwrap_or(self.config.default_processing_ms as f64)
    }

    fn record_processing_time(&self, duration: Duration) {
        self.avg_processing
            .lock()
            .expect("processing mean lock poisoned")
            .record(duration.as_millis() as f64);
    }

    /// Every lifecycle update funnels through here.
    async fn commit_transition<F>(
        &self,
        task_id: Uuid,
        mutate: F,
    ) -> Result<Task, OrchestratorError>
    where
        F: Fn(&mut Task) -> Result<(), OrchestratorError> + Send + Sync,
    {
        match (&self.repository, &self.locks) {
            (Some(repository), Some(locks)) => {
                // Phase 1: prepare.
                if !repository.health_check().await {
                    return Err(OrchestratorError::ServiceUnavailable(
                        "Repository unavailable, cannot commit state transition".to_string(),
                    ));
                }
                let lock_name = keys::task_state_lock(task_id);
                let acquisition = locks.acquire(&lock_name, &self.config.lock).await;
                let token = match (acquisition.acquired, acquisition.token) {
                    (true, Some(token)) => token,
                    _ => {
                        return Err(OrchestratorError::Conflict(format!(
                            "Could not acquire state lock for task {task_id}"
                        )))
                    }
                };

                // Phase 2: commit. Phase 3: cleanup on every exit path.
                let result = self.commit_locked(repository, task_id, &mutate).await;
                locks.release(&lock_name, &token).await;
                result
            }
            _ => self.commit_in_memory(task_id, &mutate).await,
        }
    }

    async fn commit_locked<F>(
        &self,
        repository: &TaskRepository,
        task_id: Uuid,
        mutate: &F,
    ) -> Result<Task, OrchestratorError>
    where
        F: Fn(&mut Task) -> Result<(), OrchestratorError> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let stored = repository
                .find_by_id(task_id)
                .await
                .map_err(repo_err)?
                .ok_or_else(|| {
                    OrchestratorError::NotFound(format!("Task {task_id} not found"))
                })?;
            let expected_version = stored.version;

            let mut updated = stored;
            mutate(&mut updated)?;

            match repository.update(&updated, expected_version).await {
                Ok(version) => {
                    updated.version = version;
                    self.tasks.write().await.insert(task_id, updated.clone());
                    return Ok(updated);
                }
                Err(RepositoryError::VersionConflict { expected, actual }) => {
                    attempt += 1;
                    tracing::warn!(
                        task_id = %task_id,
                        expected = expected,
                        actual = actual,
                        attempt = attempt,
                        "Commit hit version conflict, reconciling"
                    );
                    if let Some(reconciler) = &self.reconciler {
                        let memory = self.tasks.read().await.get(&task_id).cloned();
                        let outcome = reconciler.reconcile(task_id, memory.as_ref()).await?;
                        if let Some(task) = outcome.task {
                            self.tasks.write().await.insert(task_id, task);
                        }
                    }
                    if attempt >= COMMIT_RETRIES {
                        return Err(OrchestratorError::Conflict(format!(
                            "Version conflict persisted after reconciliation for task {task_id}"
                        )));
                    }
                }
                Err(RepositoryError::NotFound(_)) => {
                    return Err(OrchestratorError::NotFound(format!(
                        "Task {task_id} disappeared during commit"
                    )))
                }
                Err(e) => return Err(repo_err(e)),
            }
        }
    }

    /// Ephemeral fast path: a per-task mutex replaces the distributed lock
    /// and the memory map replaces the repository. Not durable.
    async fn commit_in_memory<F>(
        &self,
        task_id: Uuid,
        mutate: &F,
    ) -> Result<Task, OrchestratorError>
    where
        F: Fn(&mut Task) -> Result<(), OrchestratorError> + Send + Sync,
    {
        let mutex = {
            let mut local = self.local_locks.lock().await;
            local
                .entry(task_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = mutex.lock().await;

        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("Task {task_id} not found")))?;

        let mut updated = task.clone();
        mutate(&mut updated)?;
        updated.version = task.version + 1;
        *task = updated.clone();
        let terminal = updated.is_terminal();
        drop(tasks);

        if terminal {
            self.local_locks.lock().await.remove(&task_id);
        }
        Ok(updated)
    }

    /// Load the task for a claimed job: memory, then repository, then the
    /// recovery strategy for a job with no record anywhere.
    async fn ensure_task(&self, job: &Job) -> Result<Task, OrchestratorError> {
        if let Some(task) = self.tasks.read().await.get(&job.id) {
            return Ok(task.clone());
        }

        if let Some(repository) = &self.repository {
            match repository.find_by_id(job.id).await {
                Ok(Some(task)) => {
                    self.tasks.write().await.insert(job.id, task.clone());
                    return Ok(task);
                }
                Ok(None) => {}
                Err(e) => return Err(repo_err(e)),
            }
        }

        let state = self.queue.get_state(job.id).await.ok().flatten();
        let task = self
            .recovery
            .recover(job, state, self.repository.as_ref())
            .await?;
        self.tasks.write().await.insert(job.id, task.clone());
        Ok(task)
    }

    /// Persist a progress report and fan it out. Progress 100 is reserved
    /// for completion.
    pub async fn update_progress(
        &self,
        task_id: Uuid,
        progress: u8,
    ) -> Result<(), OrchestratorError> {
        let clamped = progress.min(99);
        let task = self
            .commit_transition(task_id, move |task| {
                if task.is_terminal() {
                    return Err(OrchestratorError::InvalidTransition(
                        "Task already terminal".to_string(),
                    ));
                }
                task.progress = clamped;
                Ok(())
            })
            .await?;
        self.events
            .publish(TaskEvent::progress(task_id, task.progress));
        Ok(())
    }

    async fn broadcast_queue_positions(&self) {
        let waiting = match self.queue.waiting_ids().await {
            Ok(waiting) => waiting,
            Err(e) => {
                tracing::debug!(error = %e, "Could not read waiting jobs for position update");
                return;
            }
        };
        let mean = self.mean_processing_ms();
        for (index, id) in waiting.iter().enumerate() {
            let wait_ms = (index as f64 * mean) as u64;
            self.events
                .publish(TaskEvent::queue_position(*id, index as i64, wait_ms));
        }
    }

    /// Dispatch path for one claimed job.
    async fn execute_job(self: Arc<Self>, job: Job) -> anyhow::Result<()> {
        let task_id = job.id;
        self.health.heartbeat();
        if let Ok(counts) = self.queue.counts().await {
            self.health.update_queue_depth(counts.waiting);
        }

        let task = self.ensure_task(&job).await?;

        let processor = match self.registry.get(&task.task_type).await {
            Some(processor) => processor,
            None => {
                let err = OrchestratorError::Internal(format!(
                    "No processor registered for task type {}",
                    task.task_type
                ));
                self.finish_with_error(task_id, &err, Duration::ZERO).await;
                return Err(err.into());
            }
        };

        // Transition to running unless recovery already rebuilt it running.
        let task = if task.status == TaskStatus::Running {
            task
        } else {
            self.commit_transition(task_id, |task| {
                if task.status == TaskStatus::Running {
                    return Ok(());
                }
                if !task.status.can_transition_to(TaskStatus::Running) {
                    return Err(OrchestratorError::InvalidTransition(format!(
                        "Cannot start task in status {}",
                        task.status
                    )));
                }
                task.mark_running();
                Ok(())
            })
            .await?
        };

        self.events.publish(TaskEvent::started(task_id));
        tracing::info!(task_id = %task_id, task_type = %task.task_type, "Task started");

        let (progress_tx, mut progress_rx) = mpsc::channel::<u8>(16);
        {
            let manager = Arc::downgrade(&self);
            tokio::spawn(async move {
                while let Some(progress) = progress_rx.recv().await {
                    let Some(manager) = manager.upgrade() else { break };
                    if let Err(e) = manager.update_progress(task_id, progress).await {
                        tracing::debug!(task_id = %task_id, error = %e, "Progress persist failed");
                    }
                }
            });
        }

        let ctx = ProcessorContext::new(task_id, task.tenant.clone(), progress_tx);
        let task_timeout = task.timeout();
        let params = task.params.clone();

        // Two nested deadlines: the task's own timeout enforced by this
        // race, and the watchdog at timeout + grace as the backstop for a
        // worker body that never comes back.
        let operation = async move {
            match tokio::time::timeout(task_timeout, processor.process(params, ctx)).await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(OrchestratorError::Internal(format!(
                    "Processor failed: {e}"
                ))),
                Err(_) => Err(OrchestratorError::task_timeout(format!(
                    "Task exceeded its {} ms timeout",
                    task_timeout.as_millis()
                ))),
            }
        };

        let started_at = tokio::time::Instant::now();
        let outcome = self
            .watchdog
            .monitor(task_id, &task.task_type.to_string(), task_timeout, operation)
            .await;
        let elapsed = started_at.elapsed();

        match outcome {
            Ok(result) => {
                let committed = {
                    let result = result.clone();
                    self.commit_transition(task_id, move |task| {
                        if !task.status.can_transition_to(TaskStatus::Completed) {
                            return Err(OrchestratorError::InvalidTransition(format!(
                                "Cannot complete task in status {}",
                                task.status
                            )));
                        }
                        task.mark_completed(result.clone());
                        Ok(())
                    })
                    .await
                };
                let task = committed?;

                self.events.publish(TaskEvent::completed(task_id, result));
                self.health.record_success(elapsed.as_millis() as u64);
                self.record_processing_time(elapsed);
                if let Err(e) = self.documents.archive_task(&task).await {
                    tracing::debug!(task_id = %task_id, error = %e, "Task archival failed");
                }
                self.broadcast_queue_positions().await;
                tracing::info!(
                    task_id = %task_id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Task completed"
                );
                Ok(())
            }
            Err(err @ OrchestratorError::Timeout { watchdog: true, .. }) => {
                // The watchdog already force-failed the record from its own
                // task; only the bookkeeping is left.
                self.health.record_watchdog_timeout();
                self.broadcast_queue_positions().await;
                Err(err.into())
            }
            Err(err) => {
                self.finish_with_error(task_id, &err, elapsed).await;
                Err(err.into())
            }
        }
    }

    /// Terminal transition for a processor error or own-timeout, plus event
    /// fan-out and health bookkeeping.
    async fn finish_with_error(
        &self,
        task_id: Uuid,
        err: &OrchestratorError,
        elapsed: Duration,
    ) {
        let terminal_status = if err.is_timeout() {
            TaskStatus::Timeout
        } else {
            TaskStatus::Failed
        };
        let message = err.to_string();

        let committed = {
            let message = message.clone();
            self.commit_transition(task_id, move |task| {
                if !task.status.can_transition_to(terminal_status) {
                    return Err(OrchestratorError::InvalidTransition(format!(
                        "Cannot fail task in status {}",
                        task.status
                    )));
                }
                match terminal_status {
                    TaskStatus::Timeout => task.mark_timeout(message.clone()),
                    _ => task.mark_failed(message.clone()),
                }
                Ok(())
            })
            .await
        };

        match committed {
            Ok(_) => {
                self.events.publish(TaskEvent::failed(
                    task_id,
                    terminal_status,
                    message.clone(),
                    err.kind(),
                ));
            }
            Err(commit_err) => {
                tracing::error!(
                    task_id = %task_id,
                    error = %commit_err,
                    "Could not record terminal failure"
                );
            }
        }

        self.health.record_error(elapsed.as_millis() as u64);
        self.broadcast_queue_positions().await;
        tracing::error!(task_id = %task_id, error = %message, status = %terminal_status, "Task failed");
    }
}

#[async_trait::async_trait]
impl ForceFailHandler for TaskManager {
    async fn force_fail_task(&self, task_id: Uuid, reason: &str) {
        if let Err(e) = self.force_fail(task_id, reason).await {
            tracing::error!(task_id = %task_id, error = %e, "Watchdog force-fail failed");
        }
    }
}

/// Queue-facing adapter; holds the manager weakly so a shut-down manager is
/// not kept alive by the queue.
struct TaskJobHandler {
    manager: std::sync::Weak<TaskManager>,
}

#[async_trait::async_trait]
impl JobHandler for TaskJobHandler {
    async fn handle(&self, job: Job) -> anyhow::Result<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("Task manager was dropped, cannot process job"))?;
        manager.execute_job(job).await
    }
}

fn repo_err(e: RepositoryError) -> OrchestratorError {
    match e {
        RepositoryError::NotFound(id) => {
            OrchestratorError::NotFound(format!("Task {id} not found"))
        }
        RepositoryError::VersionConflict { expected, actual } => OrchestratorError::Conflict(
            format!("Version conflict: expected {expected}, stored {actual}"),
        ),
        RepositoryError::BackendUnavailable(msg) => OrchestratorError::ServiceUnavailable(msg),
        RepositoryError::Serialization(msg) => OrchestratorError::Internal(msg),
    }
}
