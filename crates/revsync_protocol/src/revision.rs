//! Document revisions.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A JSON-object-shaped document body.
pub type Properties = serde_json::Map<String, Value>;

/// One version of one document.
///
/// A revision is identified by its document id and revision id. The
/// sequence number and body can be attached after construction; the ids
/// are fixed except through [`Revision::copy_with_doc_id`].
///
/// Two revisions are equal iff their `doc_id` and `rev_id` match.
#[derive(Debug, Clone)]
pub struct Revision {
    doc_id: String,
    rev_id: String,
    deleted: bool,
    sequence: u64,
    body: Option<Properties>,
    remote_sequence: Option<String>,
}

impl Revision {
    /// Creates a revision without a body.
    pub fn new(doc_id: impl Into<String>, rev_id: impl Into<String>, deleted: bool) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            deleted,
            sequence: 0,
            body: None,
            remote_sequence: None,
        }
    }

    /// Creates a revision from a document body.
    ///
    /// Reads `_id`, `_rev` and `_deleted` from the body. A body without
    /// `_id` yields a revision with an unassigned (empty) document id.
    pub fn from_properties(properties: Properties) -> ProtocolResult<Self> {
        let doc_id = properties
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let rev_id = properties
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("_rev"))?
            .to_string();
        let deleted = properties
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut rev = Self::new(doc_id, rev_id, deleted);
        rev.body = Some(properties);
        Ok(rev)
    }

    /// Returns the document id.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Returns the revision id.
    pub fn rev_id(&self) -> &str {
        &self.rev_id
    }

    /// Returns true if this revision is a deletion tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Returns the local sequence number (0 if not assigned).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Assigns the local sequence number.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Returns this revision with the given sequence number.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Returns the document body, if one is attached.
    pub fn body(&self) -> Option<&Properties> {
        self.body.as_ref()
    }

    /// Attaches a document body.
    pub fn set_body(&mut self, body: Properties) {
        self.body = Some(body);
    }

    /// Returns this revision with the given body attached.
    pub fn with_body(mut self, body: Properties) -> Self {
        self.body = Some(body);
        self
    }

    /// Takes the body out of the revision.
    pub fn take_body(&mut self) -> Option<Properties> {
        self.body.take()
    }

    /// Returns the remote change-feed sequence this revision was seen at.
    pub fn remote_sequence(&self) -> Option<&str> {
        self.remote_sequence.as_deref()
    }

    /// Returns this revision tagged with a remote change-feed sequence.
    pub fn with_remote_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.remote_sequence = Some(sequence.into());
        self
    }

    /// Returns the generation number (1 for a document's first revision).
    pub fn generation(&self) -> u32 {
        generation_from_rev_id(&self.rev_id)
    }

    /// Copies this revision under the given ids.
    ///
    /// The current document id must be unassigned or equal to `doc_id`.
    /// The copy's body carries `_id` and `_rev`.
    pub fn copy_with_doc_id(
        &self,
        doc_id: impl Into<String>,
        rev_id: impl Into<String>,
    ) -> ProtocolResult<Self> {
        let doc_id = doc_id.into();
        let rev_id = rev_id.into();
        if !self.doc_id.is_empty() && self.doc_id != doc_id {
            return Err(ProtocolError::DocIdMismatch {
                existing: self.doc_id.clone(),
                requested: doc_id,
            });
        }

        let mut properties = self.body.clone().unwrap_or_default();
        properties.insert("_id".into(), Value::String(doc_id.clone()));
        properties.insert("_rev".into(), Value::String(rev_id.clone()));

        let mut copy = Self::new(doc_id, rev_id, self.deleted);
        copy.body = Some(properties);
        Ok(copy)
    }

    /// Builds the minimal body of a deletion tombstone.
    pub fn tombstone_properties(&self) -> Properties {
        let mut properties = Properties::new();
        properties.insert("_id".into(), Value::String(self.doc_id.clone()));
        properties.insert("_rev".into(), Value::String(self.rev_id.clone()));
        properties.insert("_deleted".into(), Value::Bool(true));
        properties
    }
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.doc_id == other.doc_id && self.rev_id == other.rev_id
    }
}

impl Eq for Revision {}

impl Hash for Revision {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.doc_id.hash(state);
        self.rev_id.hash(state);
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{} #{}{}}}",
            self.doc_id,
            self.rev_id,
            if self.deleted { "DEL" } else { "" }
        )
    }
}

/// Extracts the generation number from a revision id.
///
/// Returns 0 when the id has no numeric prefix before a dash.
pub fn generation_from_rev_id(rev_id: &str) -> u32 {
    match rev_id.find('-') {
        Some(pos) if pos > 0 => rev_id[..pos].parse().unwrap_or(0),
        _ => 0,
    }
}

/// The `_revisions` ancestry object attached to uploaded documents.
///
/// `ids` holds the hash suffixes newest first; `start` is the generation
/// of the newest one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionHistory {
    /// Generation of the first entry in `ids`.
    pub start: u32,
    /// Revision hash suffixes, newest first.
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// Builds the history from full revision ids, newest first.
    pub fn from_rev_ids<S: AsRef<str>>(rev_ids: &[S]) -> ProtocolResult<Self> {
        let first = rev_ids
            .first()
            .ok_or(ProtocolError::MissingField("_revisions.ids"))?;
        let start = generation_from_rev_id(first.as_ref());
        if start == 0 {
            return Err(ProtocolError::InvalidRevId(first.as_ref().to_string()));
        }

        let ids = rev_ids
            .iter()
            .map(|rev_id| {
                let rev_id = rev_id.as_ref();
                rev_id
                    .split_once('-')
                    .map(|(_, suffix)| suffix.to_string())
                    .ok_or_else(|| ProtocolError::InvalidRevId(rev_id.to_string()))
            })
            .collect::<ProtocolResult<Vec<_>>>()?;

        Ok(Self { start, ids })
    }

    /// Expands back into full revision ids, newest first.
    pub fn to_rev_ids(&self) -> Vec<String> {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, suffix)| format!("{}-{}", self.start.saturating_sub(i as u32), suffix))
            .collect()
    }

    /// Reads the history out of a document body's `_revisions` field.
    pub fn from_properties(properties: &Properties) -> ProtocolResult<Option<Self>> {
        match properties.get("_revisions") {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    /// Converts into a JSON value for embedding in a body.
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "start": self.start, "ids": self.ids })
    }
}
