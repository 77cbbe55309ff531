//! Error types for the sync engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Local storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Conflict resolution failed: {0}")]
    Resolution(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
