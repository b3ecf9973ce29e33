//! Local store trait definition.

use crate::error::StoreResult;
use revsync_protocol::{Revision, RevisionList};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// A named predicate selecting which revisions replicate.
pub type RevisionFilter = Arc<dyn Fn(&Revision) -> bool + Send + Sync>;

/// Options for [`LocalStore::load_revision_body`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentOptions {
    /// Include `_attachments` in the loaded body.
    pub include_attachments: bool,
}

impl ContentOptions {
    /// Options that load attachment references along with the body.
    pub fn with_attachments() -> Self {
        Self {
            include_attachments: true,
        }
    }
}

/// A committed local change, delivered to subscribers in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    /// The new revision (with its sequence).
    pub rev: Revision,
    /// URL of the remote this revision was pulled from, if any.
    pub source: Option<String>,
}

/// The local document store as seen by the replication engine.
///
/// Replication-log and anchor methods are keyed by the remote URL and the
/// direction (`push = true` for local → remote).
///
/// # Invariants
///
/// - Sequences are assigned monotonically in commit order
/// - `changes_since` and notifications agree on that order
/// - Writes between `begin_transaction` and `end_transaction(false)` are
///   rolled back as one unit
///
/// # Implementors
///
/// - [`super::MemoryStore`] - In-memory reference store
pub trait LocalStore: Send + Sync {
    /// Returns the store's private UUID (never shared with remotes).
    fn private_uuid(&self) -> String;

    /// Returns the current revision of every document changed strictly
    /// after `sequence`, oldest first, restricted by `filter`.
    fn changes_since(
        &self,
        sequence: u64,
        filter: Option<&RevisionFilter>,
    ) -> StoreResult<RevisionList>;

    /// Loads the body of a revision.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the revision does not exist locally.
    fn load_revision_body(&self, rev: &Revision, options: ContentOptions)
        -> StoreResult<Revision>;

    /// Returns the revision's ancestry as revision ids, newest first,
    /// starting with the revision itself.
    fn revision_history(&self, rev: &Revision) -> StoreResult<Vec<String>>;

    /// Returns true if the revision exists locally.
    fn contains_revision(&self, rev: &Revision) -> StoreResult<bool>;

    /// Inserts a revision received from a remote, keeping its revision id.
    ///
    /// `history` lists revision ids newest first, starting with `rev`.
    fn force_insert(
        &self,
        rev: Revision,
        history: &[String],
        source: Option<&str>,
    ) -> StoreResult<Revision>;

    /// Looks up a registered filter.
    fn filter_named(&self, name: &str) -> Option<RevisionFilter>;

    /// Records a revision as pending replication.
    fn log_revision(&self, remote: &str, push: bool, rev: &Revision) -> StoreResult<()>;

    /// Marks a pending revision as attempted at `attempted_at` (ms since epoch).
    fn update_log_revision(
        &self,
        remote: &str,
        push: bool,
        rev: &Revision,
        attempted_at: i64,
    ) -> StoreResult<()>;

    /// Removes a revision from the replication log.
    fn remove_log_for_revision(&self, remote: &str, push: bool, rev: &Revision)
        -> StoreResult<()>;

    /// Resets every attempted entry back to "not yet attempted".
    fn reset_revisions(&self, remote: &str, push: bool) -> StoreResult<()>;

    /// Returns the entries not yet attempted, oldest sequence first.
    fn pending_revisions(&self, remote: &str, push: bool) -> StoreResult<RevisionList>;

    /// Returns the last sequence checkpointed with a remote.
    fn last_sequence_with_remote(&self, remote: &str, push: bool) -> StoreResult<Option<String>>;

    /// Records the last sequence checkpointed with a remote.
    fn set_last_sequence(&self, sequence: &str, remote: &str, push: bool) -> StoreResult<()>;

    /// Begins a transaction. Transactions nest.
    fn begin_transaction(&self) -> StoreResult<()>;

    /// Ends a transaction, committing or rolling back.
    fn end_transaction(&self, commit: bool) -> StoreResult<()>;

    /// Subscribes to committed changes.
    fn subscribe(&self) -> UnboundedReceiver<ChangeNotification>;
}
