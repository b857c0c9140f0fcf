//! Idempotency response cache
//!
//! Storage half of the at-most-once write protection: buffered responses
//! keyed by idempotency key with a TTL (default 24 h). Only responses with
//! status < 500 are cached; 5xx failures are presumed transient and the
//! next attempt gets a fresh execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::keys;
use crate::traits::{StateBackend, StateError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            stored_at: Utc::now(),
        }
    }

    /// Caching policy: 5xx responses are presumed transient and never
    /// replayed.
    pub fn is_cacheable(status: u16) -> bool {
        status < 500
    }
}

#[derive(Clone)]
pub struct IdempotencyStore {
    backend: Arc<dyn StateBackend>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(backend: Arc<dyn StateBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Look up a buffered response for the key. An undecodable record is
    /// treated as a miss.
    pub async fn get(&self, key: &str) -> Result<Option<CachedResponse>, StateError> {
        let raw = self
            .backend
            .get_value(&keys::idempotency_key(key))
            .await?;
        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(response) => Ok(Some(response)),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Discarding undecodable idempotency record");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Buffer a terminal response. Returns false when the policy skipped
    /// caching (5xx).
    pub async fn store(&self, key: &str, response: &CachedResponse) -> Result<bool, StateError> {
        if !CachedResponse::is_cacheable(response.status) {
            tracing::debug!(key = %key, status = response.status, "Not caching 5xx response");
            return Ok(false);
        }

        let serialized = serde_json::to_string(response)
            .map_err(|e| StateError::Backend(format!("serialize cached response: {e}")))?;
        self.backend
            .set_value(&keys::idempotency_key(key), &serialized, self.ttl)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStateBackend;

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(
            Arc::new(MemoryStateBackend::new()),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let store = store();
        let response = CachedResponse::new(
            202,
            vec![("content-type".to_string(), "application/json".to_string())],
            br#"{"taskId":"abc"}"#.to_vec(),
        );
        assert!(store.store("key-1", &response).await.unwrap());

        let cached = store.get("key-1").await.unwrap().unwrap();
        assert_eq!(cached.status, 202);
        assert_eq!(cached.body, response.body);
        assert_eq!(cached.headers, response.headers);
    }

    #[tokio::test]
    async fn server_errors_are_not_cached() {
        let store = store();
        let response = CachedResponse::new(503, vec![], b"unavailable".to_vec());
        assert!(!store.store("key-1", &response).await.unwrap());
        assert!(store.get("key-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn client_errors_are_cached() {
        let store = store();
        let response = CachedResponse::new(400, vec![], b"bad params".to_vec());
        assert!(store.store("key-1", &response).await.unwrap());
        assert_eq!(store.get("key-1").await.unwrap().unwrap().status, 400);
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let store = store();
        assert!(store.get("unseen").await.unwrap().is_none());
    }
}
