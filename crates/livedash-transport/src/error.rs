//! Transport error types.

use livedash_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Wrong last revision: expected={expected}, current={current}")]
    RevisionMismatch { expected: u64, current: u64 },

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Subscription closed")]
    Closed,
}

impl From<CoreError> for TransportError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidKey(msg) => Self::InvalidKey(msg),
            other => Self::InvalidSubject(other.to_string()),
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
