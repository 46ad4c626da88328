//! Error types for the dispatch pipeline.
//!
//! These are the crate's *internal* errors: store and sink failures,
//! serialization problems, bad configuration. Errors that cross the pipeline
//! boundary toward callers are standardized separately in
//! [`crate::transform::NormalizedError`].

use thiserror::Error;

/// Result type alias for the dispatch pipeline.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Internal error type for the dispatch pipeline.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Circuit-breaker store read/write failure
    #[error("breaker store error: {0}")]
    Store(String),

    /// Telemetry sink failure (swallowed by the recorder, never fatal)
    #[error("telemetry sink error: {0}")]
    Telemetry(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}
