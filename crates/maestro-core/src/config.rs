//! Configuration module
//!
//! Env-driven configuration for the task execution core: backend connection
//! URLs, timeouts, worker concurrency, and recovery policy.

use std::env;
use std::str::FromStr;

const DEFAULT_TASK_TIMEOUT_MS: u64 = 60_000;
const MAX_TASK_TIMEOUT_MS: u64 = 600_000;
const WORKER_CONCURRENCY: usize = 5;
const WATCHDOG_GRACE_PERIOD_MS: u64 = 30_000;
const TASK_TTL_SECS: u64 = 86_400;
const LOCK_TTL_MS: u64 = 10_000;
const LOCK_RETRY_COUNT: u32 = 3;
const LOCK_RETRY_DELAY_MS: u64 = 50;
const LOCK_BACKOFF_MULTIPLIER: f64 = 2.0;
const IDEMPOTENCY_TTL_SECS: u64 = 86_400;
const QUEUE_POLL_INTERVAL_MS: u64 = 1_000;
const QUEUE_READY_TIMEOUT_MS: u64 = 5_000;
const JOB_LOCK_DURATION_MS: u64 = 600_000;
const STALLED_CHECK_INTERVAL_MS: u64 = 30_000;
const MAX_STALLED_COUNT: u32 = 2;

/// Policy for a queue job whose task record is absent from the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    /// Synthesise a minimal task from the queue job and continue.
    #[default]
    Rebuild,
    /// Reject the job with a desynchronisation error; an operator must act.
    Strict,
}

impl FromStr for RecoveryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rebuild" => Ok(RecoveryMode::Rebuild),
            "strict" => Ok(RecoveryMode::Strict),
            _ => Err(anyhow::anyhow!("Invalid recovery strategy: {}", s)),
        }
    }
}

/// Application configuration for the orchestration core.
#[derive(Clone, Debug)]
pub struct Config {
    /// Queue backend connection URL. `None` selects the in-memory queue.
    pub redis_url: Option<String>,
    /// Repository/lock backend URL; falls back to `redis_url` when unset.
    /// `None` on both selects ephemeral (non-durable) mode.
    pub state_redis_url: Option<String>,
    pub default_task_timeout_ms: u64,
    pub max_task_timeout_ms: u64,
    pub worker_concurrency: usize,
    pub watchdog_grace_period_ms: u64,
    pub task_ttl_secs: u64,
    pub lock_ttl_ms: u64,
    pub lock_retry_count: u32,
    pub lock_retry_delay_ms: u64,
    pub lock_backoff_multiplier: f64,
    pub idempotency_ttl_secs: u64,
    pub idempotency_auto_generate: bool,
    pub recovery_strategy: RecoveryMode,
    /// Base URL for the streaming/document collaborator. Sinks are disabled
    /// when unset.
    pub graphrag_base_url: Option<String>,
    pub queue_poll_interval_ms: u64,
    pub queue_ready_timeout_ms: u64,
    pub job_lock_duration_ms: u64,
    pub stalled_check_interval_ms: u64,
    pub max_stalled_count: u32,
    pub environment: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: None,
            state_redis_url: None,
            default_task_timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            max_task_timeout_ms: MAX_TASK_TIMEOUT_MS,
            worker_concurrency: WORKER_CONCURRENCY,
            watchdog_grace_period_ms: WATCHDOG_GRACE_PERIOD_MS,
            task_ttl_secs: TASK_TTL_SECS,
            lock_ttl_ms: LOCK_TTL_MS,
            lock_retry_count: LOCK_RETRY_COUNT,
            lock_retry_delay_ms: LOCK_RETRY_DELAY_MS,
            lock_backoff_multiplier: LOCK_BACKOFF_MULTIPLIER,
            idempotency_ttl_secs: IDEMPOTENCY_TTL_SECS,
            idempotency_auto_generate: false,
            recovery_strategy: RecoveryMode::Rebuild,
            graphrag_base_url: None,
            queue_poll_interval_ms: QUEUE_POLL_INTERVAL_MS,
            queue_ready_timeout_ms: QUEUE_READY_TIMEOUT_MS,
            job_lock_duration_ms: JOB_LOCK_DURATION_MS,
            stalled_check_interval_ms: STALLED_CHECK_INTERVAL_MS,
            max_stalled_count: MAX_STALLED_COUNT,
            environment: "development".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let config = Config {
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            state_redis_url: env::var("STATE_REDIS_URL").ok().filter(|s| !s.is_empty()),
            default_task_timeout_ms: env_parse("DEFAULT_TASK_TIMEOUT_MS", DEFAULT_TASK_TIMEOUT_MS),
            max_task_timeout_ms: env_parse("MAX_TASK_TIMEOUT_MS", MAX_TASK_TIMEOUT_MS),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", WORKER_CONCURRENCY),
            watchdog_grace_period_ms: env_parse(
                "WATCHDOG_GRACE_PERIOD_MS",
                WATCHDOG_GRACE_PERIOD_MS,
            ),
            task_ttl_secs: env_parse("TASK_TTL_SECS", TASK_TTL_SECS),
            lock_ttl_ms: env_parse("LOCK_TTL_MS", LOCK_TTL_MS),
            lock_retry_count: env_parse("LOCK_RETRY_COUNT", LOCK_RETRY_COUNT),
            lock_retry_delay_ms: env_parse("LOCK_RETRY_DELAY_MS", LOCK_RETRY_DELAY_MS),
            lock_backoff_multiplier: env_parse("LOCK_BACKOFF_MULTIPLIER", LOCK_BACKOFF_MULTIPLIER),
            idempotency_ttl_secs: env_parse("IDEMPOTENCY_TTL_SECS", IDEMPOTENCY_TTL_SECS),
            idempotency_auto_generate: env_parse("IDEMPOTENCY_AUTO_GENERATE", false),
            recovery_strategy: env::var("TASK_RECOVERY_STRATEGY")
                .ok()
                .map(|s| s.parse())
                .transpose()?
                .unwrap_or_default(),
            graphrag_base_url: env::var("GRAPHRAG_BASE_URL").ok().filter(|s| !s.is_empty()),
            queue_poll_interval_ms: env_parse("QUEUE_POLL_INTERVAL_MS", QUEUE_POLL_INTERVAL_MS),
            queue_ready_timeout_ms: env_parse("QUEUE_READY_TIMEOUT_MS", QUEUE_READY_TIMEOUT_MS),
            job_lock_duration_ms: env_parse("JOB_LOCK_DURATION_MS", JOB_LOCK_DURATION_MS),
            stalled_check_interval_ms: env_parse(
                "STALLED_CHECK_INTERVAL_MS",
                STALLED_CHECK_INTERVAL_MS,
            ),
            max_stalled_count: env_parse("MAX_STALLED_COUNT", MAX_STALLED_COUNT),
            environment,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.max_task_timeout_ms < self.default_task_timeout_ms {
            return Err(anyhow::anyhow!(
                "MAX_TASK_TIMEOUT_MS ({}) must be >= DEFAULT_TASK_TIMEOUT_MS ({})",
                self.max_task_timeout_ms,
                self.default_task_timeout_ms
            ));
        }

        if self.worker_concurrency == 0 {
            return Err(anyhow::anyhow!("WORKER_CONCURRENCY must be at least 1"));
        }

        if self.lock_ttl_ms == 0 {
            return Err(anyhow::anyhow!("LOCK_TTL_MS must be positive"));
        }

        if self.lock_backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("LOCK_BACKOFF_MULTIPLIER must be >= 1.0"));
        }

        if let Some(url) = &self.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(anyhow::anyhow!(
                    "REDIS_URL must be a valid Redis connection string"
                ));
            }
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        let env = self.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    /// URL for the repository/lock backend, falling back to the queue URL.
    pub fn state_url(&self) -> Option<&str> {
        self.state_redis_url
            .as_deref()
            .or(self.redis_url.as_deref())
    }
}
