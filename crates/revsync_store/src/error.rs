//! Error types for store operations.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during local store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested document or revision does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A transaction was misused (e.g. ended without being begun).
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The store is closed.
    #[error("store is closed")]
    Closed,

    /// Stored data is inconsistent.
    #[error("store corrupted: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Creates a not-found error for a document revision.
    pub fn revision_not_found(doc_id: &str, rev_id: &str) -> Self {
        Self::NotFound(format!("{doc_id} #{rev_id}"))
    }

    /// Returns true if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
