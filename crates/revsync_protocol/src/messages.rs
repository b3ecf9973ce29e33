//! Request and response bodies of the remote document API.

use crate::error::ProtocolError;
use crate::revision::{Properties, Revision};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// `_revs_diff` request body: `{docId: [revId, ...]}`.
pub type RevsDiffRequest = BTreeMap<String, Vec<String>>;

/// Per-document entry of a `_revs_diff` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    /// Revisions the remote does not have.
    #[serde(default)]
    pub missing: Vec<String>,
    /// Revisions the remote has that could be ancestors of the missing ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub possible_ancestors: Option<Vec<String>>,
}

/// `_revs_diff` response body.
///
/// Documents absent from the response are fully up to date on the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevsDiffResponse(pub BTreeMap<String, RevsDiffEntry>);

impl RevsDiffResponse {
    /// Returns true if the remote is missing nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if the remote reported this revision as missing.
    pub fn is_missing(&self, doc_id: &str, rev_id: &str) -> bool {
        self.0
            .get(doc_id)
            .is_some_and(|entry| entry.missing.iter().any(|r| r == rev_id))
    }

    /// Returns the total number of missing revisions.
    pub fn missing_count(&self) -> usize {
        self.0.values().map(|entry| entry.missing.len()).sum()
    }
}

/// `_bulk_docs` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    /// Documents to write.
    pub docs: Vec<Properties>,
    /// False to make the remote keep the supplied revision ids.
    pub new_edits: bool,
    /// True to apply the whole batch atomically.
    pub all_or_nothing: bool,
}

impl BulkDocsRequest {
    /// Creates a replication upload: `new_edits=false`, `all_or_nothing=true`.
    pub fn replicated(docs: Vec<Properties>) -> Self {
        Self {
            docs,
            new_edits: false,
            all_or_nothing: true,
        }
    }
}

/// Response to a document or `_local` document PUT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResponse {
    /// Whether the write succeeded.
    #[serde(default)]
    pub ok: bool,
    /// Document id written.
    #[serde(default)]
    pub id: Option<String>,
    /// New revision of the document.
    #[serde(default)]
    pub rev: Option<String>,
}

/// One revision listed in a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    /// Revision id.
    pub rev: String,
}

/// One entry of a `_changes` feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Remote sequence token (number or string, opaque).
    pub seq: Value,
    /// Document id.
    pub id: String,
    /// Leaf revisions of the document.
    #[serde(default)]
    pub changes: Vec<ChangeRev>,
    /// True if the document is deleted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl ChangeEntry {
    /// Creates a change for a single revision.
    pub fn new(seq: impl Into<Value>, id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            seq: seq.into(),
            id: id.into(),
            changes: vec![ChangeRev { rev: rev.into() }],
            deleted: false,
        }
    }

    /// Returns the sequence as an opaque string token.
    pub fn seq_token(&self) -> String {
        sequence_token(&self.seq)
    }

    /// Expands the change into revisions tagged with its sequence.
    pub fn revisions(&self) -> Vec<Revision> {
        let token = self.seq_token();
        self.changes
            .iter()
            .map(|change| {
                Revision::new(self.id.clone(), change.rev.clone(), self.deleted)
                    .with_remote_sequence(token.clone())
            })
            .collect()
    }
}

/// Renders a sequence value as an opaque token (strings unquoted).
pub(crate) fn sequence_token(seq: &Value) -> String {
    match seq {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `_changes` response body for `normal` and `longpoll` feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    /// Changes, oldest first.
    pub results: Vec<ChangeEntry>,
    /// Sequence of the last change in the database at response time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<Value>,
}

impl ChangesResponse {
    /// Returns `last_seq` as an opaque token.
    pub fn last_seq_token(&self) -> Option<String> {
        self.last_seq.as_ref().map(sequence_token)
    }
}

/// Change feed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedMode {
    /// A single `feed=normal` request.
    OneShot,
    /// Repeated `feed=longpoll` requests.
    LongPoll,
    /// One streaming `feed=continuous` response.
    Continuous,
}

impl FeedMode {
    /// Returns the `feed=` query value.
    pub fn feed_name(&self) -> &'static str {
        match self {
            FeedMode::OneShot => "normal",
            FeedMode::LongPoll => "longpoll",
            FeedMode::Continuous => "continuous",
        }
    }
}

impl fmt::Display for FeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.feed_name())
    }
}

impl FromStr for FeedMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" | "oneshot" => Ok(FeedMode::OneShot),
            "longpoll" => Ok(FeedMode::LongPoll),
            "continuous" => Ok(FeedMode::Continuous),
            other => Err(ProtocolError::Json(format!("unknown feed mode: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn revs_diff_response_lookup() {
        let response: RevsDiffResponse = serde_json::from_value(json!({
            "a": {"missing": ["2-x", "3-y"]},
            "b": {"missing": ["1-z"], "possible_ancestors": ["1-q"]},
        }))
        .unwrap();

        assert!(response.is_missing("a", "3-y"));
        assert!(!response.is_missing("a", "1-z"));
        assert!(!response.is_missing("c", "1-z"));
        assert_eq!(response.missing_count(), 3);

        let empty: RevsDiffResponse = serde_json::from_value(json!({})).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn bulk_docs_body_shape() {
        let doc = json!({"_id": "a", "_rev": "1-x"}).as_object().cloned().unwrap();
        let body = serde_json::to_value(BulkDocsRequest::replicated(vec![doc])).unwrap();
        assert_eq!(
            body,
            json!({
                "docs": [{"_id": "a", "_rev": "1-x"}],
                "new_edits": false,
                "all_or_nothing": true,
            })
        );
    }

    #[test]
    fn change_entry_parsing() {
        let change: ChangeEntry = serde_json::from_value(json!({
            "seq": 12,
            "id": "doc",
            "changes": [{"rev": "2-b"}, {"rev": "2-c"}],
            "deleted": true,
        }))
        .unwrap();
        assert_eq!(change.seq_token(), "12");

        let revs = change.revisions();
        assert_eq!(revs.len(), 2);
        assert!(revs[0].is_deleted());
        assert_eq!(revs[1].remote_sequence(), Some("12"));

        let missing_seq = serde_json::from_value::<ChangeEntry>(json!({"id": "doc"}));
        assert!(missing_seq.is_err());
    }

    #[test]
    fn string_sequences_stay_unquoted() {
        let change = ChangeEntry::new("4-g1AAAA", "doc", "1-a");
        assert_eq!(change.seq_token(), "4-g1AAAA");

        let response: ChangesResponse =
            serde_json::from_value(json!({"results": [], "last_seq": 9})).unwrap();
        assert_eq!(response.last_seq_token().as_deref(), Some("9"));
    }

    #[test]
    fn feed_modes() {
        assert_eq!(FeedMode::OneShot.feed_name(), "normal");
        assert_eq!("longpoll".parse::<FeedMode>().unwrap(), FeedMode::LongPoll);
        assert_eq!(
            "continuous".parse::<FeedMode>().unwrap(),
            FeedMode::Continuous
        );
        assert!("sometimes".parse::<FeedMode>().is_err());
    }
}
