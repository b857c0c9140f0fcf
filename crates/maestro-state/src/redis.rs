//! Redis-backed state.
//!
//! Uses a deadpool connection pool; every atomic multi-step operation goes
//! through a Lua [`Script`] so there is no read-modify-write window at the
//! backend. Single-instance Redis gives full mutual exclusion for the lock
//! primitives; replicated deployments weaken that during failover, which the
//! optimistic version check on the repository still catches.

use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use std::time::Duration;

use crate::scripts;
use crate::traits::{CasOutcome, StateBackend, StateError};

const DEFAULT_POOL_SIZE: usize = 16;

pub struct RedisStateBackend {
    pool: Pool,
}

impl RedisStateBackend {
    pub fn new(url: &str) -> Result<Self, StateError> {
        let cfg = PoolConfig::from_url(url);
        let pool = cfg
            .builder()
            .map_err(|e| StateError::Connection(e.to_string()))?
            .max_size(DEFAULT_POOL_SIZE)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StateError::Connection(e.to_string()))?;

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StateError> {
        self.pool
            .get()
            .await
            .map_err(|e| StateError::Connection(e.to_string()))
    }
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn backend_err(e: redis::RedisError) -> StateError {
    StateError::Backend(e.to_string())
}

#[async_trait]
impl StateBackend for RedisStateBackend {
    async fn put_new(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StateError> {
        let mut conn = self.conn().await?;
        let written: i64 = Script::new(scripts::PUT_NEW)
            .key(key)
            .arg(value)
            .arg(1i64)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(written == 1)
    }

    async fn get_versioned(&self, key: &str) -> Result<Option<(String, i64)>, StateError> {
        let mut conn = self.conn().await?;
        let (data, version): (Option<String>, Option<i64>) = redis::cmd("HMGET")
            .arg(key)
            .arg("data")
            .arg("version")
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        match (data, version) {
            (Some(data), Some(version)) => Ok(Some((data, version))),
            _ => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: i64,
        value: &str,
        ttl: Duration,
    ) -> Result<CasOutcome, StateError> {
        let mut conn = self.conn().await?;
        let (flag, version): (i64, i64) = Script::new(scripts::COMPARE_AND_SWAP)
            .key(key)
            .arg(expected_version)
            .arg(value)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        match flag {
            1 => Ok(CasOutcome::Updated { version }),
            0 => Ok(CasOutcome::VersionMismatch { actual: version }),
            _ => Ok(CasOutcome::Missing),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StateError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await.map_err(backend_err)?;
        Ok(removed > 0)
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<String>, u64), StateError> {
        let mut conn = self.conn().await?;
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok((keys, next))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StateError> {
        let mut conn = self.conn().await?;
        let set: bool = conn
            .pexpire(key, ttl_ms(ttl))
            .await
            .map_err(backend_err)?;
        Ok(set)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StateError> {
        let mut conn = self.conn().await?;
        let remaining: i64 = conn.pttl(key).await.map_err(backend_err)?;
        if remaining >= 0 {
            Ok(Some(Duration::from_millis(remaining as u64)))
        } else {
            Ok(None)
        }
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>, StateError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await.map_err(backend_err)?;
        Ok(value)
    }

    async fn set_value(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StateError> {
        let mut conn = self.conn().await?;
        let acquired: i64 = Script::new(scripts::LOCK_ACQUIRE)
            .key(key)
            .arg(value)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(acquired == 1)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StateError> {
        let mut conn = self.conn().await?;
        let released: i64 = Script::new(scripts::LOCK_RELEASE)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(released == 1)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StateError> {
        let mut conn = self.conn().await?;
        let extended: i64 = Script::new(scripts::LOCK_EXTEND)
            .key(key)
            .arg(value)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(extended == 1)
    }

    async fn ping(&self) -> Result<(), StateError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}
