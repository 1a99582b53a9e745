//! Buffer error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Invalid buffer configuration: {0}")]
    InvalidConfig(String),

    #[error("No async runtime available for tick scheduling")]
    NoRuntime,
}

pub type BufferResult<T> = Result<T, BufferError>;
