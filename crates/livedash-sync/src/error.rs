//! Sync error types.

use livedash_core::CoreError;
use livedash_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Conflict: expected revision {expected}, store is at {current}")]
    Conflict { expected: u64, current: u64 },

    #[error("Local storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Local storage access denied: {0}")]
    Security(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Dashboard is locked")]
    Locked,

    #[error("No active dashboard")]
    NoActiveDashboard,

    #[error("Dashboard is not shared")]
    NotShared,

    #[error("Dashboard limit reached ({0})")]
    LimitReached(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether this is a local persistence failure that left the in-memory
    /// document intact.
    pub fn is_local_persistence(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_) | Self::Security(_) | Self::Io(_))
    }
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotFound(msg) => Self::NotFound(msg),
            TransportError::InvalidKey(msg) | TransportError::InvalidSubject(msg) => {
                Self::InvalidKey(msg)
            }
            TransportError::RevisionMismatch { expected, current } => {
                Self::Conflict { expected, current }
            }
            TransportError::ConnectionLost | TransportError::Closed => Self::ConnectionLost,
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(e: CoreError) -> Self {
        Self::InvalidKey(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
