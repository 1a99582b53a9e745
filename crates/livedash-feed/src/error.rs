//! Feed error types.

use livedash_core::CoreError;
use livedash_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid extraction expression: {0}")]
    InvalidExtraction(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<CoreError> for FeedError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidSubject(msg) => Self::InvalidSubject(msg),
            CoreError::InvalidKey(msg) => Self::InvalidKey(msg),
            CoreError::InvalidWindow(msg) => Self::InvalidSubject(format!("window: {msg}")),
            CoreError::Extraction(msg) => Self::InvalidExtraction(msg),
        }
    }
}

impl From<TransportError> for FeedError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotFound(msg) => Self::NotFound(msg),
            TransportError::InvalidSubject(msg) => Self::InvalidSubject(msg),
            TransportError::InvalidKey(msg) => Self::InvalidKey(msg),
            TransportError::ConnectionLost => Self::ConnectionLost,
            other => Self::Transport(other.to_string()),
        }
    }
}

pub type FeedResult<T> = Result<T, FeedError>;
