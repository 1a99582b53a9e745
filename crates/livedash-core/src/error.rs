//! Core error types.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid time window: {0}")]
    InvalidWindow(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
