use std::sync::Arc;

use maestro_core::Config;

use crate::memory::MemoryStateBackend;
use crate::redis::RedisStateBackend;
use crate::traits::{StateBackend, StateError};

/// Create a state backend based on configuration.
///
/// A configured `STATE_REDIS_URL` (or `REDIS_URL`) selects Redis; with
/// neither set the in-memory backend is used and every record dies with the
/// process. Ephemeral mode is logged loudly.
pub fn create_state_backend(config: &Config) -> Result<Arc<dyn StateBackend>, StateError> {
    match config.state_url() {
        Some(url) => {
            let backend = RedisStateBackend::new(url)?;
            tracing::info!("State backend: redis");
            Ok(Arc::new(backend))
        }
        None => {
            tracing::warn!(
                "No state backend URL configured; using in-memory state (non-durable)"
            );
            Ok(Arc::new(MemoryStateBackend::new()))
        }
    }
}
