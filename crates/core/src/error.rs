//! Core error model.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while parsing or validating core values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A timestamp could not be interpreted.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A connector key did not follow `source:account[:subresource]`.
    #[error("invalid connector key: {0}")]
    InvalidConnectorKey(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_timestamp(msg: impl Into<String>) -> Self {
        Self::InvalidTimestamp(msg.into())
    }
}
