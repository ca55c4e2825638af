use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::Retryable;

/// Failure of a single model-backed role call.
#[derive(Error, Debug)]
pub enum RoleError {
    #[error("{role} request failed: {reason}")]
    Request { role: &'static str, reason: String },

    #[error("{role} returned an unusable response: {reason}")]
    InvalidResponse { role: &'static str, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{role} is unavailable: {reason}")]
    Unavailable { role: &'static str, reason: String },
}

impl Retryable for RoleError {
    fn timed_out(operation: &str, after: Duration) -> Self {
        RoleError::Timeout {
            operation: operation.to_string(),
            after,
        }
    }

    fn is_retryable(&self) -> bool {
        !matches!(self, RoleError::Unavailable { .. })
    }
}

/// Distillation of one document failed; retried on its next stable event.
#[derive(Error, Debug)]
pub enum DistillError {
    #[error("Extraction failed for {path}: {source}")]
    Extraction {
        path: PathBuf,
        #[source]
        source: RoleError,
    },

    #[error("Extraction produced no blocks for {path}")]
    NoCandidates { path: PathBuf },
}
