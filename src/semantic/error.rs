use std::time::Duration;
use thiserror::Error;

use crate::pipeline::Retryable;

/// Errors from embedding generation. Never fatal to ingestion.
#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("Failed to initialize embedding model: {0}")]
    ModelInit(String),

    #[error("Unknown embedding model '{0}'")]
    UnknownModel(String),

    #[error("Failed to generate embedding: {0}")]
    Embedding(String),

    #[error("Embedding request failed: {0}")]
    Request(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedder returned {actual} vectors for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Environment variable {var} is not set")]
    MissingCredential { var: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

impl Retryable for EmbedError {
    fn timed_out(operation: &str, after: Duration) -> Self {
        EmbedError::Timeout {
            operation: operation.to_string(),
            after,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmbedError::Embedding(_) | EmbedError::Request(_) | EmbedError::Timeout { .. }
        )
    }
}
