//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Feed error: {0}")]
    Feed(#[from] livedash_feed::FeedError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] livedash_buffer::BufferError),

    #[error("Sync error: {0}")]
    Sync(#[from] livedash_sync::SyncError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] livedash_telemetry::TelemetryError),

    #[error("Unknown widget: {0}")]
    UnknownWidget(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
