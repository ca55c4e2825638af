use std::time::Duration;
use thiserror::Error;

use crate::pipeline::Retryable;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid block {id}: {reason}")]
    InvalidBlock { id: String, reason: String },

    #[error("Corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Store task failed: {0}")]
    Task(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl Retryable for StoreError {
    fn timed_out(operation: &str, after: Duration) -> Self {
        StoreError::Timeout {
            operation: operation.to_string(),
            after,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(_)
                | StoreError::Connection(_)
                | StoreError::Task(_)
                | StoreError::Timeout { .. }
        )
    }
}
