//! Durable state for the orchestration core: the task repository, the
//! distributed lock manager, and the idempotency response cache, all built
//! over a swappable key-value backend (Redis in production, in-memory for
//! ephemeral mode and tests).

pub mod factory;
pub mod idempotency;
pub mod keys;
pub mod lock;
pub mod memory;
pub mod redis;
pub mod repository;
mod scripts;
pub mod traits;

pub use factory::create_state_backend;
pub use idempotency::{CachedResponse, IdempotencyStore};
pub use lock::{LockAcquisition, LockConfig, LockManager};
pub use memory::MemoryStateBackend;
pub use self::redis::RedisStateBackend;
pub use repository::{RepositoryError, TaskRepository};
pub use traits::{CasOutcome, StateBackend, StateError};
