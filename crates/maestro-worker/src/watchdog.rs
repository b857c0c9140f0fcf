//! Worker watchdog
//!
//! An external deadline around each executing task, independent of the
//! task's own timeout handling. The watchdog timer runs as its own spawned
//! task, so it fires even when the worker body has wedged the task it runs
//! on (blocking call inside async code, a processor that swallowed its own
//! timeout). It cannot cancel CPU-bound work it cannot reach; its job is to
//! force the task record terminal so the system keeps making progress.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use maestro_core::OrchestratorError;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Added on top of the task's own timeout before the watchdog fires.
    pub grace_period: Duration,
    /// When set, a firing watchdog force-fails the task record.
    pub enable_force_kill: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            enable_force_kill: true,
        }
    }
}

/// Narrow hook back into the task manager. Held weakly so the watchdog
/// never keeps the manager alive.
#[async_trait::async_trait]
pub trait ForceFailHandler: Send + Sync {
    async fn force_fail_task(&self, task_id: Uuid, reason: &str);
}

#[derive(Debug, Clone, Default)]
pub struct WatchdogMetrics {
    pub total_monitored: u64,
    pub total_timeouts: u64,
    pub total_success: u64,
    pub total_errors: u64,
    pub average_execution_ms: f64,
    pub last_timeout: Option<DateTime<Utc>>,
}

pub struct Watchdog {
    config: WatchdogConfig,
    handler: Arc<RwLock<Weak<dyn ForceFailHandler>>>,
    total_monitored: AtomicU64,
    total_timeouts: Arc<AtomicU64>,
    total_success: AtomicU64,
    total_errors: AtomicU64,
    completed_operations: AtomicU64,
    total_execution_ms: AtomicU64,
    last_timeout: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        let no_handler: Weak<dyn ForceFailHandler> = Weak::<NoopHandler>::new();
        Self {
            config,
            handler: Arc::new(RwLock::new(no_handler)),
            total_monitored: AtomicU64::new(0),
            total_timeouts: Arc::new(AtomicU64::new(0)),
            total_success: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            completed_operations: AtomicU64::new(0),
            total_execution_ms: AtomicU64::new(0),
            last_timeout: Arc::new(Mutex::new(None)),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.config.grace_period
    }

    /// Install the force-fail hook. Done once at worker startup.
    pub fn set_force_fail_handler(&self, handler: Weak<dyn ForceFailHandler>) {
        *self.handler.write().expect("watchdog handler lock poisoned") = handler;
    }

    /// Run `operation` under the watchdog deadline `task_timeout + grace`.
    ///
    /// The deadline timer is a separate spawned task: when it expires it
    /// records the timeout, force-fails the task through the hook, and the
    /// eventual return value of the operation is discarded in favour of a
    /// watchdog-kind timeout error.
    pub async fn monitor<T, F>(
        &self,
        task_id: Uuid,
        task_type: &str,
        task_timeout: Duration,
        operation: F,
    ) -> Result<T, OrchestratorError>
    where
        F: Future<Output = Result<T, OrchestratorError>>,
    {
        self.total_monitored.fetch_add(1, Ordering::Relaxed);

        let deadline = task_timeout + self.config.grace_period;
        let fired = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        let timer = {
            let fired = fired.clone();
            let timeouts = self.total_timeouts.clone();
            let last_timeout = self.last_timeout.clone();
            let handler = self.handler.clone();
            let enable_force_kill = self.config.enable_force_kill;
            let task_type = task_type.to_string();

            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel_rx => {}
                    _ = tokio::time::sleep(deadline) => {
                        fired.store(true, Ordering::SeqCst);
                        timeouts.fetch_add(1, Ordering::Relaxed);
                        *last_timeout.lock().expect("watchdog metrics lock poisoned") =
                            Some(Utc::now());
                        tracing::error!(
                            task_id = %task_id,
                            task_type = %task_type,
                            deadline_ms = deadline.as_millis() as u64,
                            "Watchdog deadline exceeded; worker body unresponsive"
                        );

                        if enable_force_kill {
                            let handler = handler
                                .read()
                                .expect("watchdog handler lock poisoned")
                                .upgrade();
                            match handler {
                                Some(handler) => {
                                    handler
                                        .force_fail_task(
                                            task_id,
                                            "watchdog timeout: worker exceeded task deadline plus grace period",
                                        )
                                        .await;
                                }
                                None => {
                                    tracing::warn!(
                                        task_id = %task_id,
                                        "Watchdog fired but no force-fail handler is installed"
                                    );
                                }
                            }
                        }
                    }
                }
            })
        };

        let started = tokio::time::Instant::now();
        let result = operation.await;
        let _ = cancel_tx.send(());
        let _ = timer.await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.completed_operations.fetch_add(1, Ordering::Relaxed);
        self.total_execution_ms.fetch_add(elapsed_ms, Ordering::Relaxed);

        if fired.load(Ordering::SeqCst) {
            // The operation eventually returned, but the record is already
            // terminal; its outcome no longer counts.
            return Err(OrchestratorError::watchdog_timeout(format!(
                "Task {task_id} exceeded its deadline plus the watchdog grace period"
            )));
        }

        match &result {
            Ok(_) => self.total_success.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.total_errors.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    pub fn metrics(&self) -> WatchdogMetrics {
        let completed = self.completed_operations.load(Ordering::Relaxed);
        let total_ms = self.total_execution_ms.load(Ordering::Relaxed);
        WatchdogMetrics {
            total_monitored: self.total_monitored.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            total_success: self.total_success.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            average_execution_ms: if completed == 0 {
                0.0
            } else {
                total_ms as f64 / completed as f64
            },
            last_timeout: *self
                .last_timeout
                .lock()
                .expect("watchdog metrics lock poisoned"),
        }
    }
}

struct NoopHandler;

#[async_trait::async_trait]
impl ForceFailHandler for NoopHandler {
    async fn force_fail_task(&self, _task_id: Uuid, _reason: &str) {}
}
