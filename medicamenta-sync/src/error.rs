//! Error types for the sync engine
//!
//! Operational outcomes (handler failures, conflicts, being offline) are never
//! errors; they are reported as data. `SyncError` covers storage failures and
//! programmer errors such as malformed registrations.

use thiserror::Error;
use uuid::Uuid;

use crate::operation::OperationType;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid handler registration: {0}")]
    InvalidHandler(String),

    #[error("A {operation_type} handler is already registered for collection pattern '{pattern}'")]
    AmbiguousHandler {
        operation_type: OperationType,
        pattern: String,
    },

    #[error("Conflict {0} is already resolved")]
    ConflictAlreadyResolved(Uuid),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Sync database {0} is already open in another engine")]
    DatabaseLocked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<validator::ValidationErrors> for SyncError {
    fn from(err: validator::ValidationErrors) -> Self {
        SyncError::InvalidConfig(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
