//! Redis-backed work queue.
//!
//! Waiting jobs live in a ZSET scored by priority band and an insertion
//! sequence, so dispatch order is priority descending with FIFO inside a
//! band. Job records are JSON strings keyed by job id; active, completed,
//! and failed jobs are tracked in sets. Claiming and removal are Lua
//! scripts so a job is never dispatched twice or removed mid-claim.

use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::job::{Job, JobState};
use crate::traits::{QueueCounts, QueueError, WorkQueue};

const KEY_WAITING: &str = "maestro:queue:waiting";
const KEY_SEQ: &str = "maestro:queue:seq";
const KEY_JOB_PREFIX: &str = "maestro:queue:job:";
const KEY_ACTIVE: &str = "maestro:queue:active";
const KEY_COMPLETED: &str = "maestro:queue:completed";
const KEY_FAILED: &str = "maestro:queue:failed";
const KEY_ACTIVE_AT: &str = "maestro:queue:active_at";
const KEY_STALLED: &str = "maestro:queue:stalled";

const DEFAULT_POOL_SIZE: usize = 16;

/// Priority bands are ~10 wide; a large band multiplier keeps the insertion
/// sequence from ever crossing bands.
const BAND_MULTIPLIER: f64 = 1e12;

/// KEYS: waiting, active, active_at; ARGV: now_ms, job key prefix.
/// Atomically claims the lowest-scored waiting job and returns its record.
const CLAIM: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1], 1)
if #popped == 0 then
  return false
end
local id = popped[1]
redis.call('SADD', KEYS[2], id)
redis.call('HSET', KEYS[3], id, ARGV[1])
return redis.call('GET', ARGV[2] .. id)
"#;

/// KEYS: waiting, job key; ARGV: job id.
/// Removes a job only while it is still waiting.
const REMOVE_WAITING: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('DEL', KEYS[2])
  return 1
end
return 0
"#;

pub struct RedisWorkQueue {
    pool: Pool,
    notify: Arc<Notify>,
}

impl RedisWorkQueue {
    pub fn new(url: &str) -> Result<Self, QueueError> {
        let cfg = PoolConfig::from_url(url);
        let pool = cfg
            .builder()
            .map_err(|e| QueueError::Connection(e.to_string()))?
            .max_size(DEFAULT_POOL_SIZE)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            notify: Arc::new(Notify::new()),
        })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, QueueError> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    fn job_key(id: Uuid) -> String {
        format!("{}{}", KEY_JOB_PREFIX, id)
    }

    fn score(priority: i32, seq: u64) -> f64 {
        let band = (100 - priority.clamp(0, 100)) as f64;
        band * BAND_MULTIPLIER + seq as f64
    }
}

fn backend_err(e: redis::RedisError) -> QueueError {
    QueueError::Backend(e.to_string())
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn add(&self, job: Job) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&job)
            .map_err(|e| QueueError::Backend(format!("serialize job: {e}")))?;

        let mut conn = self.conn().await?;
        let seq: u64 = conn.incr(KEY_SEQ, 1).await.map_err(backend_err)?;
        let score = Self::score(job.priority, seq);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(Self::job_key(job.id))
            .arg(&serialized)
            .ignore()
            .cmd("ZADD")
            .arg(KEY_WAITING)
            .arg(score)
            .arg(job.id.to_string())
            .ignore();
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_err)?;

        self.notify.notify_one();
        Ok(())
    }

    async fn pop_next(&self) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = Script::new(CLAIM)
            .key(KEY_WAITING)
            .key(KEY_ACTIVE)
            .key(KEY_ACTIVE_AT)
            .arg(Utc::now().timestamp_millis())
            .arg(KEY_JOB_PREFIX)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;

        match raw {
            Some(raw) => {
                let job: Job = serde_json::from_str(&raw)
                    .map_err(|e| QueueError::Backend(format!("decode job: {e}")))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn mark_completed(&self, id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let id = id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .srem(KEY_ACTIVE, &id)
            .ignore()
            .hdel(KEY_ACTIVE_AT, &id)
            .ignore()
            .hdel(KEY_STALLED, &id)
            .ignore()
            .sadd(KEY_COMPLETED, &id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_err)?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let id_str = id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .srem(KEY_ACTIVE, &id_str)
            .ignore()
            .hdel(KEY_ACTIVE_AT, &id_str)
            .ignore()
            .hdel(KEY_STALLED, &id_str)
            .ignore()
            .sadd(KEY_FAILED, &id_str)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_err)?;
        tracing::debug!(job_id = %id, reason = %reason, "Job marked failed");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(Self::job_key(id)).await.map_err(backend_err)?;
        match raw {
            Some(raw) => {
                let job: Job = serde_json::from_str(&raw)
                    .map_err(|e| QueueError::Backend(format!("decode job: {e}")))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn get_state(&self, id: Uuid) -> Result<Option<JobState>, QueueError> {
        let mut conn = self.conn().await?;
        let id = id.to_string();

        let waiting: Option<f64> = conn
            .zscore(KEY_WAITING, &id)
            .await
            .map_err(backend_err)?;
        if waiting.is_some() {
            return Ok(Some(JobState::Waiting));
        }
        let active: bool = conn.sismember(KEY_ACTIVE, &id).await.map_err(backend_err)?;
        if active {
            return Ok(Some(JobState::Active));
        }
        let completed: bool = conn
            .sismember(KEY_COMPLETED, &id)
            .await
            .map_err(backend_err)?;
        if completed {
            return Ok(Some(JobState::Completed));
        }
        let failed: bool = conn.sismember(KEY_FAILED, &id).await.map_err(backend_err)?;
        if failed {
            return Ok(Some(JobState::Failed));
        }
        Ok(None)
    }

    async fn remove_waiting(&self, id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let removed: i64 = Script::new(REMOVE_WAITING)
            .key(KEY_WAITING)
            .key(Self::job_key(id))
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(removed == 1)
    }

    async fn waiting_ids(&self) -> Result<Vec<Uuid>, QueueError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn
            .zrange(KEY_WAITING, 0, -1)
            .await
            .map_err(backend_err)?;
        Ok(raw
            .into_iter()
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn().await?;
        let (waiting, active, completed, failed): (u64, u64, u64, u64) = redis::pipe()
            .zcard(KEY_WAITING)
            .scard(KEY_ACTIVE)
            .scard(KEY_COMPLETED)
            .scard(KEY_FAILED)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(QueueCounts {
            waiting,
            active,
            completed,
            failed,
        })
    }

    async fn reap_stalled(
        &self,
        lock_duration: Duration,
        max_stalled: u32,
    ) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.conn().await?;
        let active_at: Vec<(String, i64)> =
            conn.hgetall(KEY_ACTIVE_AT).await.map_err(backend_err)?;

        let horizon = Utc::now().timestamp_millis() - lock_duration.as_millis() as i64;
        let mut failed_jobs = Vec::new();

        for (id_str, since_ms) in active_at {
            if since_ms > horizon {
                continue;
            }
            let Ok(id) = Uuid::parse_str(&id_str) else {
                continue;
            };

            let stalls: u32 = conn
                .hincr(KEY_STALLED, &id_str, 1)
                .await
                .map_err(backend_err)?;

            if stalls > max_stalled {
                self.mark_failed(id, "stalled beyond max stall count").await?;
                if let Some(job) = self.get_job(id).await? {
                    failed_jobs.push(job);
                }
                tracing::warn!(job_id = %id, stalls = stalls, "Stalled job failed");
            } else {
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .srem(KEY_ACTIVE, &id_str)
                    .ignore()
                    .hdel(KEY_ACTIVE_AT, &id_str)
                    .ignore()
                    .cmd("ZADD")
                    .arg(KEY_WAITING)
                    .arg(0f64)
                    .arg(&id_str)
                    .ignore();
                let _: () = pipe.query_async(&mut conn).await.map_err(backend_err)?;
                tracing::warn!(job_id = %id, stalls = stalls, "Requeued stalled job");
            }
        }
        Ok(failed_jobs)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    async fn close(&self) -> Result<(), QueueError> {
        // Connections return to the pool on drop; nothing to tear down.
        Ok(())
    }
}
