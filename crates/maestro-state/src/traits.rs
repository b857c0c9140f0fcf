//! State backend abstraction
//!
//! The repository, lock manager, and idempotency cache all talk to a keyed
//! store through this trait. The Redis backend is the production
//! implementation; the in-memory backend serves ephemeral mode and tests.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// State backend operation errors
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Outcome of a version-checked write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write succeeded; the stored version is now `expected + 1`.
    Updated { version: i64 },
    /// The stored version differed; nothing was written.
    VersionMismatch { actual: i64 },
    /// No record exists under the key.
    Missing,
}

/// Keyed store with versioned records, plain values, and lock primitives.
///
/// Every multi-step operation is atomic at the backend: the Redis
/// implementation uses Lua scripts, the in-memory one a single mutex.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Write a fresh versioned record (version 1) only if the key is absent.
    /// Returns false when a live record already exists.
    async fn put_new(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StateError>;

    /// Read a versioned record as `(value, version)`.
    async fn get_versioned(&self, key: &str) -> Result<Option<(String, i64)>, StateError>;

    /// Atomic compare-and-swap against `expected_version`. On success the
    /// stored version becomes `expected_version + 1` and the TTL is reset.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: i64,
        value: &str,
        ttl: Duration,
    ) -> Result<CasOutcome, StateError>;

    /// Delete a key. Returns true if a record was removed.
    async fn delete(&self, key: &str) -> Result<bool, StateError>;

    /// One scan iteration over keys matching a prefix pattern (`foo:*`).
    /// Returns the matched keys and the next cursor (0 when exhausted).
    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<String>, u64), StateError>;

    /// Reset the TTL on an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StateError>;

    /// Remaining TTL, if the key exists and has one.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StateError>;

    /// Read a plain (unversioned) value.
    async fn get_value(&self, key: &str) -> Result<Option<String>, StateError>;

    /// Write a plain value with a TTL, overwriting any previous value.
    async fn set_value(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateError>;

    /// Atomic set-if-absent with TTL (lock acquire primitive).
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StateError>;

    /// Delete the key only if its value equals `value` (lock release).
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StateError>;

    /// Reset the TTL only if the value equals `value` (lock extend).
    async fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StateError>;

    /// Cheap liveness probe (single round trip).
    async fn ping(&self) -> Result<(), StateError>;
}
