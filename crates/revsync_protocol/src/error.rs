//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while building or decoding protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A revision id is not of the form `<generation>-<hash>`.
    #[error("invalid revision id: {0:?}")]
    InvalidRevId(String),

    /// A revision was re-identified with a different document id.
    #[error("document id mismatch: revision belongs to {existing:?}, not {requested:?}")]
    DocIdMismatch {
        /// Document id the revision already carries.
        existing: String,
        /// Document id that was requested.
        requested: String,
    },

    /// A required field is absent from a document or message.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// JSON could not be parsed or produced.
    #[error("json error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::DocIdMismatch {
            existing: "a".into(),
            requested: "b".into(),
        };
        assert!(err.to_string().contains("\"a\""));
        assert_eq!(
            ProtocolError::MissingField("_id").to_string(),
            "missing field: _id"
        );
    }
}
