//! Store-specific error types.

use thiserror::Error;

/// Errors surfaced by [`crate::Store`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic-concurrency failure: the object changed since it was read.
    /// Callers re-read and retry under a bounded budget.
    #[error("conflict updating {0}")]
    Conflict(String),

    /// The named object does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Kubernetes API error other than conflict/not-found.
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Object could not be serialized for the API server.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Maps a `NotFound` result to `Ok(None)`, everything else stays an error.
pub fn ignore_not_found<T>(result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
