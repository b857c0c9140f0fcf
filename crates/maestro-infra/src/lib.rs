//! Infrastructure for the Maestro core: telemetry initialisation, the
//! idempotency middleware protecting write-side entry points, and the
//! best-effort clients for the streaming and document collaborators.

pub mod middleware;
pub mod setup;
pub mod streaming;
pub mod telemetry;

pub use middleware::idempotency::{
    idempotency_middleware, IdempotencyState, IDEMPOTENCY_KEY_HEADER, REPLAY_HEADER,
};
pub use setup::build_task_manager;
pub use streaming::GraphRagClient;
