//! Durable work queue for the orchestration core.
//!
//! A single named FIFO with priorities: jobs are addressed by the same id as
//! their task record, carry the task-type tag as the job name, and are
//! dispatched to per-name handlers by a semaphore-bounded worker pool.

pub mod job;
pub mod memory;
pub mod redis;
pub mod traits;
pub mod worker;

pub use job::{Job, JobPayload, JobState};
pub use memory::MemoryWorkQueue;
pub use self::redis::RedisWorkQueue;
pub use traits::{JobHandler, QueueCounts, QueueError, WorkQueue};
pub use worker::{QueueWorker, QueueWorkerConfig};
