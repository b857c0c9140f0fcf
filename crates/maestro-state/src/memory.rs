//! In-memory state backend.
//!
//! The local twin of the Redis backend behind the same trait: a single
//! mutexed map with lazy expiry. Serves ephemeral (non-durable) mode and
//! the hermetic test suite. `set_failing` simulates a backend outage so
//! tests can exercise `backend_unavailable` paths.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::traits::{CasOutcome, StateBackend, StateError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// Present on versioned records, absent on plain values and locks.
    version: Option<i64>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Clone, Default)]
pub struct MemoryStateBackend {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a backend outage: every subsequent call fails until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StateError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StateError::Backend("simulated backend outage".to_string()))
        } else {
            Ok(())
        }
    }

    /// Only prefix patterns (`foo:*`) are supported; that is the only shape
    /// the key layout produces.
    fn matches(pattern: &str, key: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        }
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn put_new(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StateError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| !e.is_expired(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version: Some(1),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn get_versioned(&self, key: &str) -> Result<Option<(String, i64)>, StateError> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries.get(key).and_then(|e| {
            if e.is_expired(now) {
                None
            } else {
                e.version.map(|v| (e.value.clone(), v))
            }
        }))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: i64,
        value: &str,
        ttl: Duration,
    ) -> Result<CasOutcome, StateError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => match entry.version {
                Some(actual) if actual == expected_version => {
                    entry.value = value.to_string();
                    entry.version = Some(expected_version + 1);
                    entry.expires_at = Some(now + ttl);
                    Ok(CasOutcome::Updated {
                        version: expected_version + 1,
                    })
                }
                Some(actual) => Ok(CasOutcome::VersionMismatch { actual }),
                None => Ok(CasOutcome::Missing),
            },
            _ => Ok(CasOutcome::Missing),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StateError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.remove(key) {
            Some(entry) => Ok(!entry.is_expired(now)),
            None => Ok(false),
        }
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<String>, u64), StateError> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| !e.is_expired(now) && Self::matches(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();

        let start = cursor as usize;
        if start >= keys.len() {
            return Ok((Vec::new(), 0));
        }
        let end = (start + limit.max(1)).min(keys.len());
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((keys[start..end].to_vec(), next))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StateError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StateError> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries.get(key).and_then(|e| {
            if e.is_expired(now) {
                None
            } else {
                e.expires_at.map(|at| at - now)
            }
        }))
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>, StateError> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries.get(key).and_then(|e| {
            if e.is_expired(now) {
                None
            } else {
                Some(e.value.clone())
            }
        }))
    }

    async fn set_value(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version: None,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StateError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| !e.is_expired(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version: None,
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StateError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) && entry.value == value => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StateError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) && entry.value == value => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), StateError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn put_new_rejects_existing_records() {
        let backend = MemoryStateBackend::new();
        assert!(backend.put_new("k", "a", TTL).await.unwrap());
        assert!(!backend.put_new("k", "b", TTL).await.unwrap());
        let (value, version) = backend.get_versioned("k").await.unwrap().unwrap();
        assert_eq!(value, "a");
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn cas_increments_version_by_one() {
        let backend = MemoryStateBackend::new();
        backend.put_new("k", "a", TTL).await.unwrap();
        let outcome = backend.compare_and_swap("k", 1, "b", TTL).await.unwrap();
        assert_eq!(outcome, CasOutcome::Updated { version: 2 });
        let outcome = backend.compare_and_swap("k", 1, "c", TTL).await.unwrap();
        assert_eq!(outcome, CasOutcome::VersionMismatch { actual: 2 });
        let (value, version) = backend.get_versioned("k").await.unwrap().unwrap();
        assert_eq!(value, "b");
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn cas_on_missing_key() {
        let backend = MemoryStateBackend::new();
        let outcome = backend.compare_and_swap("nope", 1, "x", TTL).await.unwrap();
        assert_eq!(outcome, CasOutcome::Missing);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let backend = MemoryStateBackend::new();
        backend
            .put_new("k", "a", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(backend.get_versioned("k").await.unwrap().is_none());
        // An expired record does not block a fresh write.
        assert!(backend.put_new("k", "b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn lock_primitives_respect_ownership() {
        let backend = MemoryStateBackend::new();
        assert!(backend.set_if_absent("lock", "token-a", TTL).await.unwrap());
        assert!(!backend.set_if_absent("lock", "token-b", TTL).await.unwrap());
        assert!(!backend.delete_if_equals("lock", "token-b").await.unwrap());
        assert!(backend.expire_if_equals("lock", "token-a", TTL).await.unwrap());
        assert!(backend.delete_if_equals("lock", "token-a").await.unwrap());
        assert!(backend.set_if_absent("lock", "token-b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn scan_pages_through_matching_keys() {
        let backend = MemoryStateBackend::new();
        for i in 0..5 {
            backend
                .put_new(&format!("tasks:{i}"), "x", TTL)
                .await
                .unwrap();
        }
        backend.put_new("other:1", "x", TTL).await.unwrap();

        let (first, cursor) = backend.scan("tasks:*", 0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_ne!(cursor, 0);
        let (rest, cursor) = backend.scan("tasks:*", cursor, 10).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(cursor, 0);
    }

    #[tokio::test]
    async fn failing_mode_surfaces_backend_errors() {
        let backend = MemoryStateBackend::new();
        backend.set_failing(true);
        assert!(backend.ping().await.is_err());
        assert!(backend.put_new("k", "a", TTL).await.is_err());
        backend.set_failing(false);
        assert!(backend.ping().await.is_ok());
    }
}
