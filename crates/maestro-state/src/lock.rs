//! Distributed lock manager
//!
//! Exclusive named locks with TTL and a fencing token. A lock is a single
//! key holding a fresh per-acquisition token; only the owner of the token
//! can release or extend it. Locks are held across the narrow commit phase
//! only, so the TTL (default 10 s) is a deadlock bound, not a lease the
//! caller is expected to exhaust.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use maestro_core::OrchestratorError;

use crate::keys;
use crate::traits::{StateBackend, StateError};

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub ttl: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            retry_count: 3,
            retry_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
        }
    }
}

/// Result of an acquisition attempt. `acquired == false` covers both
/// contention and backend failure; callers treat either as a conflict,
/// never as success.
#[derive(Debug, Clone)]
pub struct LockAcquisition {
    pub acquired: bool,
    pub token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockAcquisition {
    fn denied() -> Self {
        Self {
            acquired: false,
            token: None,
            expires_at: None,
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn StateBackend>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Try to acquire the named lock. Contention retries up to
    /// `retry_count` times with exponentially increasing delay; a backend
    /// error returns `acquired = false` immediately, without retrying.
    #[tracing::instrument(skip(self, config))]
    pub async fn acquire(&self, name: &str, config: &LockConfig) -> LockAcquisition {
        let key = keys::lock_key(name);
        let token = Uuid::new_v4().to_string();
        let mut delay = config.retry_delay;

        for attempt in 0..=config.retry_count {
            match self.backend.set_if_absent(&key, &token, config.ttl).await {
                Ok(true) => {
                    let expires_at = Utc::now()
                        + chrono::Duration::milliseconds(config.ttl.as_millis() as i64);
                    tracing::debug!(lock = %name, attempt = attempt, "Lock acquired");
                    return LockAcquisition {
                        acquired: true,
                        token: Some(token),
                        expires_at: Some(expires_at),
                    };
                }
                Ok(false) => {
                    if attempt < config.retry_count {
                        tokio::time::sleep(delay).await;
                        delay = delay.mul_f64(config.backoff_multiplier);
                    }
                }
                Err(e) => {
                    tracing::warn!(lock = %name, error = %e, "Lock backend error during acquire");
                    return LockAcquisition::denied();
                }
            }
        }

        tracing::debug!(lock = %name, retries = config.retry_count, "Lock contended, giving up");
        LockAcquisition::denied()
    }

    /// Release the lock if and only if `token` still owns it. Never deletes
    /// someone else's lock; backend errors are logged and reported as a
    /// failed release.
    pub async fn release(&self, name: &str, token: &str) -> bool {
        match self
            .backend
            .delete_if_equals(&keys::lock_key(name), token)
            .await
        {
            Ok(released) => {
                if !released {
                    tracing::warn!(lock = %name, "Release skipped: token no longer owns lock");
                }
                released
            }
            Err(e) => {
                tracing::error!(lock = %name, error = %e, "Lock backend error during release");
                false
            }
        }
    }

    /// Extend the TTL if and only if `token` still owns the lock.
    pub async fn extend(&self, name: &str, token: &str, ttl: Duration) -> bool {
        match self
            .backend
            .expire_if_equals(&keys::lock_key(name), token, ttl)
            .await
        {
            Ok(extended) => extended,
            Err(e) => {
                tracing::error!(lock = %name, error = %e, "Lock backend error during extend");
                false
            }
        }
    }

    /// Diagnostics: whether a live record exists for the name.
    pub async fn is_locked(&self, name: &str) -> Result<bool, StateError> {
        Ok(self
            .backend
            .get_value(&keys::lock_key(name))
            .await?
            .is_some())
    }

    /// Diagnostics: remaining TTL of the lock, if held.
    pub async fn get_ttl(&self, name: &str) -> Result<Option<Duration>, StateError> {
        self.backend.ttl(&keys::lock_key(name)).await
    }

    /// Scoped acquisition: run `f` under the lock, releasing on every exit
    /// path. Acquisition failure yields a `Conflict` without running `f`.
    pub async fn with_lock<T, F, Fut>(
        &self,
        name: &str,
        config: &LockConfig,
        f: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        let acquisition = self.acquire(name, config).await;
        let token = match (acquisition.acquired, acquisition.token) {
            (true, Some(token)) => token,
            _ => {
                return Err(OrchestratorError::Conflict(format!(
                    "Could not acquire lock '{}'",
                    name
                )))
            }
        };

        let result = f().await;
        self.release(name, &token).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStateBackend;

    fn manager() -> (LockManager, MemoryStateBackend) {
        let backend = MemoryStateBackend::new();
        (LockManager::new(Arc::new(backend.clone())), backend)
    }

    fn fast_config() -> LockConfig {
        LockConfig {
            ttl: Duration::from_secs(10),
            retry_count: 2,
            retry_delay: Duration::from_millis(1),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn exactly_one_concurrent_acquire_succeeds() {
        let (manager, _) = manager();
        let config = LockConfig {
            retry_count: 0,
            ..fast_config()
        };

        let a = manager.acquire("job", &config);
        let b = manager.acquire("job", &config);
        let (a, b) = tokio::join!(a, b);
        assert!(a.acquired ^ b.acquired);
    }

    #[tokio::test]
    async fn non_owner_release_returns_false_and_keeps_lock() {
        let (manager, _) = manager();
        let acquisition = manager.acquire("job", &fast_config()).await;
        assert!(acquisition.acquired);

        assert!(!manager.release("job", "someone-elses-token").await);
        assert!(manager.is_locked("job").await.unwrap());

        let token = acquisition.token.unwrap();
        assert!(manager.release("job", &token).await);
        assert!(!manager.is_locked("job").await.unwrap());
    }

    #[tokio::test]
    async fn extend_requires_ownership() {
        let (manager, _) = manager();
        let acquisition = manager.acquire("job", &fast_config()).await;
        let token = acquisition.token.unwrap();

        assert!(manager.extend("job", &token, Duration::from_secs(30)).await);
        assert!(!manager.extend("job", "wrong", Duration::from_secs(30)).await);
        let ttl = manager.get_ttl("job").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(10));
    }

    #[tokio::test]
    async fn acquire_retries_until_holder_releases() {
        let (manager, _) = manager();
        let first = manager.acquire("job", &fast_config()).await;
        let token = first.token.unwrap();

        let contender = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .acquire(
                        "job",
                        &LockConfig {
                            retry_count: 50,
                            retry_delay: Duration::from_millis(5),
                            backoff_multiplier: 1.0,
                            ..fast_config()
                        },
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.release("job", &token).await);

        let second = contender.await.unwrap();
        assert!(second.acquired);
    }

    #[tokio::test]
    async fn backend_error_denies_without_retry() {
        let (manager, backend) = manager();
        backend.set_failing(true);
        let started = std::time::Instant::now();
        let acquisition = manager
            .acquire(
                "job",
                &LockConfig {
                    retry_count: 10,
                    retry_delay: Duration::from_millis(100),
                    ..fast_config()
                },
            )
            .await;
        assert!(!acquisition.acquired);
        // No retry loop: a degraded store fails fast.
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn with_lock_releases_on_error_path() {
        let (manager, _) = manager();
        let result: Result<(), OrchestratorError> = manager
            .with_lock("job", &fast_config(), || async {
                Err(OrchestratorError::Internal("processor exploded".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(!manager.is_locked("job").await.unwrap());
    }

    #[tokio::test]
    async fn with_lock_conflicts_when_held() {
        let (manager, _) = manager();
        let held = manager
            .acquire(
                "job",
                &LockConfig {
                    retry_count: 0,
                    ..fast_config()
                },
            )
            .await;
        assert!(held.acquired);

        let result = manager
            .with_lock(
                "job",
                &LockConfig {
                    retry_count: 0,
                    ..fast_config()
                },
                || async { Ok(()) },
            )
            .await;
        match result {
            Err(OrchestratorError::Conflict(_)) => {}
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
