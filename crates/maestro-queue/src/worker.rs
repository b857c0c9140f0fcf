//! Dispatch pool: claims jobs from the work queue and routes them to named
//! handlers under a bounded concurrency budget.
//!
//! Shutdown: [`QueueWorker::shutdown`] signals the pool to stop claiming; it
//! does not wait for in-flight jobs. Give running handlers bounded time to
//! finish before process exit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::time::sleep;

use crate::traits::{JobHandler, QueueError, WorkQueue};

#[derive(Clone)]
pub struct QueueWorkerConfig {
    /// Concurrent jobs per worker process.
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Interval between stalled-job sweeps.
    pub stalled_check_interval: Duration,
    /// How long a job may stay active before it counts as stalled.
    pub job_lock_duration: Duration,
    /// Stall budget before a job is failed instead of requeued.
    pub max_stalled_count: u32,
    /// Startup barrier: the queue must answer a liveness probe within this
    /// window or `start` fails loudly.
    pub ready_timeout: Duration,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(1000),
            stalled_check_interval: Duration::from_secs(30),
            job_lock_duration: Duration::from_secs(600),
            max_stalled_count: 2,
            ready_timeout: Duration::from_secs(5),
        }
    }
}

type HandlerMap = Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>;

pub struct QueueWorker {
    queue: Arc<dyn WorkQueue>,
    handlers: HandlerMap,
    config: QueueWorkerConfig,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    started: AtomicBool,
}

impl QueueWorker {
    pub fn new(queue: Arc<dyn WorkQueue>, config: QueueWorkerConfig) -> Self {
        Self {
            queue,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            config,
            shutdown_tx: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Register the handler for one job name. All handlers must be
    /// registered before [`start`](Self::start).
    pub async fn register_handler(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        if self.is_started() {
            return Err(QueueError::Backend(
                "handlers must be registered before the worker starts".to_string(),
            ));
        }
        let name = name.into();
        self.handlers.write().await.insert(name.clone(), handler);
        tracing::debug!(job_name = %name, "Handler registered");
        Ok(())
    }

    /// Start the dispatch pool. The queue's liveness probe must succeed
    /// within `ready_timeout`; otherwise startup fails rather than
    /// presenting a healthy-looking worker that cannot pull jobs.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Backend("worker already started".to_string()));
        }

        match tokio::time::timeout(self.config.ready_timeout, self.queue.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(QueueError::Connection(format!(
                    "queue not ready at startup: {e}"
                )));
            }
            Err(_) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(QueueError::Connection(format!(
                    "queue readiness probe timed out after {:?}",
                    self.config.ready_timeout
                )));
            }
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let queue = self.queue.clone();
        let handlers = self.handlers.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            Self::worker_pool(queue, handlers, config, shutdown_rx).await;
        });

        Ok(())
    }

    async fn worker_pool(
        queue: Arc<dyn WorkQueue>,
        handlers: HandlerMap,
        config: QueueWorkerConfig,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!(
            concurrency = config.concurrency,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            "Queue worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let notifier = queue.notifier();

        let mut reap_interval = tokio::time::interval(config.stalled_check_interval);
        reap_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; consume it so the initial sweep
        // does not race startup.
        reap_interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Queue worker pool shutting down");
                    break;
                }
                _ = notifier.notified() => {
                    Self::claim_and_dispatch_one(&queue, &handlers, &semaphore).await;
                }
                _ = sleep(config.poll_interval) => {
                    Self::claim_and_dispatch_one(&queue, &handlers, &semaphore).await;
                }
                _ = reap_interval.tick() => {
                    match queue
                        .reap_stalled(config.job_lock_duration, config.max_stalled_count)
                        .await
                    {
                        Ok(failed) if !failed.is_empty() => {
                            tracing::warn!(count = failed.len(), "Stalled jobs failed by reaper");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Stalled job sweep failed"),
                    }
                }
            }
        }

        tracing::info!("Queue worker pool stopped");
    }

    async fn claim_and_dispatch_one(
        queue: &Arc<dyn WorkQueue>,
        handlers: &HandlerMap,
        semaphore: &Arc<Semaphore>,
    ) {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!("No worker slots available, skipping claim");
                return;
            }
        };

        match queue.pop_next().await {
            Ok(Some(job)) => {
                let handler = handlers.read().await.get(&job.name).cloned();
                let queue = queue.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    let job_id = job.id;
                    let job_name = job.name.clone();

                    match handler {
                        Some(handler) => match handler.handle(job).await {
                            Ok(()) => {
                                if let Err(e) = queue.mark_completed(job_id).await {
                                    tracing::error!(job_id = %job_id, error = %e, "Failed to mark job completed");
                                }
                            }
                            Err(e) => {
                                tracing::error!(job_id = %job_id, job_name = %job_name, error = %e, "Job handler failed");
                                if let Err(e) = queue.mark_failed(job_id, &e.to_string()).await {
                                    tracing::error!(job_id = %job_id, error = %e, "Failed to mark job failed");
                                }
                            }
                        },
                        None => {
                            tracing::error!(job_id = %job_id, job_name = %job_name, "No handler registered for job name");
                            let _ = queue
                                .mark_failed(job_id, "no handler registered")
                                .await;
                        }
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                tracing::trace!("No jobs waiting");
            }
            Err(e) => {
                drop(permit);
                tracing::error!(error = %e, "Failed to claim job from queue");
            }
        }
    }

    /// Signal the pool to stop claiming new jobs. Returns immediately;
    /// in-flight handlers run to completion or until their deadlines.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.as_ref() {
            let _ = tx.send(()).await;
        }
        self.started.store(false, Ordering::SeqCst);
    }
}
