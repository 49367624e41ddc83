//! Error taxonomy shared by every core subsystem.
//!
//! One variant per row of the error taxonomy table: each maps to exactly one
//! HTTP status / gRPC code at the transport boundary (see
//! `codecortex_server::error` for that mapping).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("transient external failure: {0}")]
    TransientExternal(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Whether a caller may usefully retry this error after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::TransientExternal(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
