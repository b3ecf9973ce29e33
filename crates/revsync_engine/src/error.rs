//! Error types for the replication engine.

use revsync_protocol::ProtocolError;
use revsync_store::StoreError;
use thiserror::Error;

/// Result type for replication operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during replication.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Transport or HTTP failure.
    #[error("network error{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Network {
        /// HTTP status code, when a response was received.
        status: Option<u16>,
        /// Error message.
        message: String,
    },

    /// The remote sent a body that could not be parsed or lacks a required field.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The remote rejected the request with 412 Precondition Failed.
    #[error("conflict or precondition failed")]
    ConflictOrPrecondition,

    /// The remote returned 404 Not Found.
    #[error("not found on remote")]
    NotFoundRemote,

    /// A revision could not be read from the local store.
    #[error("failed to load {doc_id} #{rev_id}: {message}")]
    LocalLoadFailure {
        /// Document id.
        doc_id: String,
        /// Revision id.
        rev_id: String,
        /// Underlying error message.
        message: String,
    },

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Protocol error (bad revision id, bad document shape).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A URL could not be parsed or joined.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The request timed out.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled.
    #[error("replication cancelled")]
    Cancelled,

    /// The session is no longer running.
    #[error("session stopped")]
    SessionStopped,

    /// No tokio runtime is available to run sessions on.
    #[error("no tokio runtime: {0}")]
    NoRuntime(String),
}

impl SyncError {
    /// Creates a network error without a status code.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            status: None,
            message: message.into(),
        }
    }

    /// Maps an unsuccessful HTTP status onto the error taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            404 => Self::NotFoundRemote,
            412 => Self::ConflictOrPrecondition,
            _ => Self::Network {
                status: Some(status),
                message: message.into(),
            },
        }
    }

    /// Returns the HTTP status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Network { status, .. } => *status,
            SyncError::NotFoundRemote => Some(404),
            SyncError::ConflictOrPrecondition => Some(412),
            _ => None,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { status: None, .. } => true,
            SyncError::Network {
                status: Some(status),
                ..
            } => *status >= 500 || *status == 408 || *status == 429,
            SyncError::Timeout => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout
        } else {
            SyncError::Network {
                status: err.status().map(|s| s.as_u16()),
                message: err.without_url().to_string(),
            }
        }
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MalformedResponse(err.to_string())
    }
}
