//! Error taxonomy for the core runtime.
//!
//! Every component returns `CoreResult<T>`. Transport-specific errors are
//! translated into this taxonomy at the Gateway boundary (see `api::to_status`)
//! and never leak past it.

use thiserror::Error;

/// Result type used throughout the core.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Error taxonomy surfaced to callers and recorded on the event bus.
#[derive(Error, Debug)]
pub enum CoreError {
    /// No such service, capability, or trace id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rate-limited, circuit open, or backpressure refusal.
    #[error("busy: {0}")]
    Busy(String),

    /// Deadline exceeded at any layer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Selected instance unreachable after retries.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Pre- or post-condition failed.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Action failed AND rollback failed; needs operator attention.
    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    /// Invalid input, bad capability name, unknown playbook.
    #[error("config error: {0}")]
    ConfigError(String),

    /// Policy rejected or approval expired.
    #[error("denied: {0}")]
    Denied(String),

    /// IO error at a persistence boundary.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catchall; always paired with a diagnostic event in the component that raised it.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether a Gateway call resulting in this error is safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Timeout(_) | CoreError::Unavailable(_))
    }
}
