//! Key layout for the state backend.
//!
//! - `tasks:{id}`: serialised task record (versioned hash)
//! - `locks:{name}`: fencing token for a named lock
//! - `idempotency:{key}`: cached write response
//!
//! Lock names for task state transitions are `task-state:{id}`, giving the
//! full key `locks:task-state:{id}`.

use uuid::Uuid;

pub const TASK_PREFIX: &str = "tasks:";
pub const LOCK_PREFIX: &str = "locks:";
pub const IDEMPOTENCY_PREFIX: &str = "idempotency:";

pub fn task_key(id: Uuid) -> String {
    format!("{}{}", TASK_PREFIX, id)
}

pub fn task_pattern() -> String {
    format!("{}*", TASK_PREFIX)
}

pub fn lock_key(name: &str) -> String {
    format!("{}{}", LOCK_PREFIX, name)
}

pub fn idempotency_key(key: &str) -> String {
    format!("{}{}", IDEMPOTENCY_PREFIX, key)
}

/// Lock name serialising all state transitions of a single task.
pub fn task_state_lock(id: Uuid) -> String {
    format!("task-state:{}", id)
}
