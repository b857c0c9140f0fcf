//! Error types module
//!
//! All framework-visible failures are unified under [`OrchestratorError`].
//! Every variant carries a taxonomy kind, a stable machine code, and a
//! user-safe message; the [`ErrorMetadata`] trait lets errors self-describe
//! how they should be presented and logged.

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for recoverable issues like lock contention
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error should be presented
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Machine-readable error code (e.g., "VERSION_CONFLICT")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Suggested action for the client
    fn suggested_action(&self) -> Option<&'static str>;

    /// Client-facing message (may differ from internal error message)
    fn client_message(&self) -> String;

    /// Whether details should be hidden in production
    fn is_sensitive(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timeout: {message}")]
    Timeout {
        message: String,
        /// True when the external watchdog fired rather than the task's own
        /// deadline. Watchdog timeouts are never retried.
        watchdog: bool,
    },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("State desynchronisation: {0}")]
    Desynchronisation(String),

    #[error("Invalid operation: {0}")]
    InvalidTransition(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Validation(format!("JSON parsing error: {}", err))
    }
}

impl From<uuid::Error> for OrchestratorError {
    fn from(err: uuid::Error) -> Self {
        OrchestratorError::Validation(format!("UUID parsing error: {}", err))
    }
}

impl OrchestratorError {
    /// Taxonomy kind carried in terminal events so downstream consumers can
    /// branch.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "validation",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::Conflict(_) => "conflict",
            OrchestratorError::Timeout { .. } => "timeout",
            OrchestratorError::ServiceUnavailable(_) => "service_unavailable",
            OrchestratorError::Desynchronisation(_) => "state_desynchronisation",
            OrchestratorError::InvalidTransition(_) => "operation",
            OrchestratorError::Internal(_) => "internal",
            OrchestratorError::InternalWithSource { .. } => "internal",
        }
    }

    pub fn watchdog_timeout(message: impl Into<String>) -> Self {
        OrchestratorError::Timeout {
            message: message.into(),
            watchdog: true,
        }
    }

    pub fn task_timeout(message: impl Into<String>) -> Self {
        OrchestratorError::Timeout {
            message: message.into(),
            watchdog: false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, OrchestratorError::Timeout { .. })
    }

    /// Get detailed error information including error chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }
}

impl ErrorMetadata for OrchestratorError {
    fn http_status_code(&self) -> u16 {
        match self {
            OrchestratorError::Validation(_) => 400,
            OrchestratorError::NotFound(_) => 404,
            OrchestratorError::Conflict(_) => 409,
            OrchestratorError::Timeout { .. } => 408,
            OrchestratorError::ServiceUnavailable(_) => 503,
            OrchestratorError::Desynchronisation(_) => 500,
            OrchestratorError::InvalidTransition(_) => 409,
            OrchestratorError::Internal(_) => 500,
            OrchestratorError::InternalWithSource { .. } => 500,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "VALIDATION_ERROR",
            OrchestratorError::NotFound(_) => "NOT_FOUND",
            OrchestratorError::Conflict(_) => "CONFLICT",
            OrchestratorError::Timeout { watchdog: false, .. } => "TASK_TIMEOUT",
            OrchestratorError::Timeout { watchdog: true, .. } => "WATCHDOG_TIMEOUT",
            OrchestratorError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            OrchestratorError::Desynchronisation(_) => "STATE_DESYNCHRONISATION",
            OrchestratorError::InvalidTransition(_) => "INVALID_TRANSITION",
            OrchestratorError::Internal(_) => "INTERNAL_ERROR",
            OrchestratorError::InternalWithSource { .. } => "INTERNAL_ERROR",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            OrchestratorError::Validation(_) => false,
            OrchestratorError::NotFound(_) => false,
            OrchestratorError::Conflict(_) => true,
            // Watchdog timeouts always terminate the task.
            OrchestratorError::Timeout { watchdog, .. } => !watchdog,
            OrchestratorError::ServiceUnavailable(_) => true,
            OrchestratorError::Desynchronisation(_) => false,
            OrchestratorError::InvalidTransition(_) => false,
            OrchestratorError::Internal(_) => true,
            OrchestratorError::InternalWithSource { .. } => true,
        }
    }

    fn suggested_action(&self) -> Option<&'static str> {
        match self {
            OrchestratorError::Validation(_) => Some("Check request parameters and try again"),
            OrchestratorError::NotFound(_) => Some("Verify the task ID exists"),
            OrchestratorError::Conflict(_) => Some("Retry against the latest task version"),
            OrchestratorError::Timeout { watchdog: false, .. } => {
                Some("Increase the task timeout or reduce the workload")
            }
            OrchestratorError::Timeout { watchdog: true, .. } => {
                Some("Inspect the worker; the processor never returned")
            }
            OrchestratorError::ServiceUnavailable(_) => Some("Retry after a short delay"),
            OrchestratorError::Desynchronisation(_) => {
                Some("Operator intervention required; see task recovery strategy")
            }
            OrchestratorError::InvalidTransition(_) => {
                Some("Check the task status before requesting this operation")
            }
            OrchestratorError::Internal(_) => Some("Retry after a short delay"),
            OrchestratorError::InternalWithSource { .. } => Some("Retry after a short delay"),
        }
    }

    fn client_message(&self) -> String {
        match self {
            OrchestratorError::Validation(msg) => msg.clone(),
            OrchestratorError::NotFound(msg) => msg.clone(),
            OrchestratorError::Conflict(msg) => msg.clone(),
            OrchestratorError::Timeout { message, .. } => message.clone(),
            OrchestratorError::ServiceUnavailable(_) => {
                "A backing service is unavailable".to_string()
            }
            OrchestratorError::Desynchronisation(msg) => msg.clone(),
            OrchestratorError::InvalidTransition(msg) => msg.clone(),
            OrchestratorError::Internal(_) => "Internal server error".to_string(),
            OrchestratorError::InternalWithSource { .. } => "Internal server error".to_string(),
        }
    }

    fn is_sensitive(&self) -> bool {
        match self {
            OrchestratorError::Validation(_) => false,
            OrchestratorError::NotFound(_) => false,
            OrchestratorError::Conflict(_) => false,
            OrchestratorError::Timeout { .. } => false,
            OrchestratorError::ServiceUnavailable(_) => true,
            OrchestratorError::Desynchronisation(_) => true,
            OrchestratorError::InvalidTransition(_) => false,
            OrchestratorError::Internal(_) => true,
            OrchestratorError::InternalWithSource { .. } => true,
        }
    }

    fn log_level(&self) -> LogLevel {
        match self {
            OrchestratorError::Validation(_) => LogLevel::Debug,
            OrchestratorError::NotFound(_) => LogLevel::Debug,
            OrchestratorError::Conflict(_) => LogLevel::Warn,
            OrchestratorError::Timeout { watchdog: false, .. } => LogLevel::Warn,
            OrchestratorError::Timeout { watchdog: true, .. } => LogLevel::Error,
            OrchestratorError::ServiceUnavailable(_) => LogLevel::Error,
            OrchestratorError::Desynchronisation(_) => LogLevel::Error,
            OrchestratorError::InvalidTransition(_) => LogLevel::Debug,
            OrchestratorError::Internal(_) => LogLevel::Error,
            OrchestratorError::InternalWithSource { .. } => LogLevel::Error,
        }
    }
}
