//! Maestro Core Library
//!
//! This crate provides the domain models, error taxonomy, configuration, and
//! collaborator hooks shared across all Maestro components.

pub mod config;
pub mod error;
pub mod hooks;
pub mod models;

// Re-export commonly used types
pub use config::{Config, RecoveryMode};
pub use error::{ErrorMetadata, LogLevel, OrchestratorError};
pub use hooks::{DocumentStore, EventSink, NoOpDocumentStore, NoOpEventSink};
