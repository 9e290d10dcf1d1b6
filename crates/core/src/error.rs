//! Core error model.

use thiserror::Error;

/// Result type used across the data model.
pub type CoreResult<T> = Result<T, CoreError>;

/// Data-model error.
///
/// Keep this focused on deterministic failures of the job model itself
/// (parsing, decoding). Store and runtime failures belong to `courier-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A stored status string is not one of `pending`, `running`, `failed`.
    #[error("invalid job status: {0}")]
    InvalidStatus(String),

    /// A payload could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_status(msg: impl Into<String>) -> Self {
        Self::InvalidStatus(msg.into())
    }

    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }
}
