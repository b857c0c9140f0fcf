//! Maestro worker: the asynchronous task execution core.
//!
//! Submission, durable persistence, queue dispatch, two-phase-commit state
//! transitions under a distributed lock, watchdog-bounded execution, worker
//! health classification, and lifecycle event fan-out.

pub mod events;
pub mod health;
pub mod manager;
pub mod processor;
pub mod reconcile;
pub mod recovery;
pub mod watchdog;

pub use events::EventHub;
pub use health::{HealthSnapshot, HealthThresholds, WorkerHealthMonitor, WorkerState};
pub use manager::{CreateTaskOptions, TaskManager, TaskManagerConfig};
pub use processor::{ProcessorContext, ProcessorRegistry, TaskProcessor};
pub use reconcile::{AuthoritativeSource, ReconcileAction, ReconcileResult, StateReconciler};
pub use recovery::TaskRecovery;
pub use watchdog::{ForceFailHandler, Watchdog, WatchdogConfig, WatchdogMetrics};
