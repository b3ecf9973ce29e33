//! Replication checkpoint documents.
//!
//! A checkpoint is a `_local` document on the remote peer recording the
//! last local sequence a replication confirmed. Its id is derived from the
//! local store's private UUID, the remote URL and the direction, so it is
//! stable for a given triple and unguessable without the private UUID.

use crate::revision::Properties;
use serde_json::Value;
use sha1::{Digest, Sha1};

/// Body key holding the checkpointed sequence token.
pub const LAST_SEQUENCE_KEY: &str = "lastSequence";

/// Computes the `_local` document id for a replication checkpoint.
///
/// `hex(SHA1(private_uuid + "\n" + remote_url + "\n" + ("1" | "0")))`
pub fn checkpoint_doc_id(private_uuid: &str, remote_url: &str, push: bool) -> String {
    let mut hasher = Sha1::new();
    hasher.update(private_uuid.as_bytes());
    hasher.update(b"\n");
    hasher.update(remote_url.as_bytes());
    hasher.update(b"\n");
    hasher.update(if push { b"1" } else { b"0" });
    hex::encode(hasher.finalize())
}

/// A checkpoint document body.
///
/// Fields other than `lastSequence` and `_rev` belong to the remote and
/// are carried through unchanged on the next save.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    properties: Properties,
}

impl Checkpoint {
    /// Creates an empty checkpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a checkpoint body fetched from the remote.
    pub fn from_properties(properties: Properties) -> Self {
        Self { properties }
    }

    /// Returns the checkpointed sequence token.
    pub fn last_sequence(&self) -> Option<&str> {
        self.properties.get(LAST_SEQUENCE_KEY).and_then(Value::as_str)
    }

    /// Sets the checkpointed sequence token.
    pub fn set_last_sequence(&mut self, sequence: impl Into<String>) {
        self.properties
            .insert(LAST_SEQUENCE_KEY.into(), Value::String(sequence.into()));
    }

    /// Returns the remote revision of the checkpoint document.
    pub fn rev(&self) -> Option<&str> {
        self.properties.get("_rev").and_then(Value::as_str)
    }

    /// Records the remote revision returned by a successful save.
    pub fn set_rev(&mut self, rev: impl Into<String>) {
        self.properties
            .insert("_rev".into(), Value::String(rev.into()));
    }

    /// Returns the body to send.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Consumes the checkpoint, returning its body.
    pub fn into_properties(self) -> Properties {
        self.properties
    }
}
