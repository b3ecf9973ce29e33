//! Pull replication: remote database → local store.

use crate::change_tracker::{ChangeTracker, ChangeTrackerClient};
use crate::error::{SyncError, SyncResult};
use crate::session::{ReplicationDirection, ReplicationSession, WeakSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use revsync_protocol::{ChangeEntry, Revision, RevisionHistory, RevisionList};
use revsync_store::LocalStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Remote sequences whose revisions are still being pulled.
///
/// The checkpoint may only advance to a sequence once every earlier
/// sequence has completed.
#[derive(Debug, Default)]
pub struct PendingSequences {
    next: u64,
    outstanding: BTreeMap<u64, Pending>,
    by_token: HashMap<String, u64>,
}

#[derive(Debug)]
struct Pending {
    token: String,
    remaining: usize,
}

impl PendingSequences {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sequence with `revisions` revisions still to pull.
    ///
    /// A sequence that is already outstanding keeps its place and gains
    /// the extra revisions.
    pub fn add(&mut self, token: impl Into<String>, revisions: usize) {
        let token = token.into();
        if let Some(pending) = self
            .by_token
            .get(&token)
            .and_then(|index| self.outstanding.get_mut(index))
        {
            pending.remaining += revisions;
            return;
        }
        let index = self.next;
        self.next += 1;
        self.by_token.insert(token.clone(), index);
        self.outstanding.insert(
            index,
            Pending {
                token,
                remaining: revisions,
            },
        );
    }

    /// Marks one revision of a sequence as pulled.
    pub fn complete(&mut self, token: &str) {
        if let Some(pending) = self
            .by_token
            .get(token)
            .and_then(|index| self.outstanding.get_mut(index))
        {
            pending.remaining = pending.remaining.saturating_sub(1);
        }
    }

    /// Drops the completed prefix and returns the newest sequence in it.
    pub fn checkpoint(&mut self) -> Option<String> {
        let mut checkpoint = None;
        while let Some(entry) = self.outstanding.first_entry() {
            if entry.get().remaining > 0 {
                break;
            }
            let pending = entry.remove();
            self.by_token.remove(&pending.token);
            checkpoint = Some(pending.token);
        }
        checkpoint
    }

    /// Returns the number of sequences not yet checkpointed.
    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    /// Returns true if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}

#[derive(Default)]
struct PullState {
    tracker: Mutex<Option<Arc<ChangeTracker>>>,
    pending: Mutex<PendingSequences>,
}

/// Pulls remote revisions the local store lacks.
///
/// A [`ChangeTracker`] reads the remote change feed starting at the
/// checkpoint; every listed revision goes through the inbox and is fetched
/// with its ancestry and inserted through [`LocalStore::force_insert`].
#[derive(Default)]
pub struct PullReplication {
    state: Arc<PullState>,
}

impl PullReplication {
    /// Creates a pull direction.
    pub fn new() -> Self {
        Self::default()
    }

    async fn pull_revision(
        session: &ReplicationSession,
        store: &dyn LocalStore,
        rev: &Revision,
    ) -> SyncResult<()> {
        let remote = session.remote().clone();
        let (doc_id, rev_id) = (rev.doc_id().to_string(), rev.rev_id().to_string());
        let body = session
            .run_io(async move { remote.get_revision(&doc_id, &rev_id).await })
            .await?;

        let history = match RevisionHistory::from_properties(&body)? {
            Some(history) => history.to_rev_ids(),
            None => vec![rev.rev_id().to_string()],
        };
        let pulled = Revision::from_properties(body)?;
        if pulled.doc_id() != rev.doc_id() || pulled.rev_id() != rev.rev_id() {
            return Err(SyncError::MalformedResponse(format!(
                "asked for {rev}, got {pulled}"
            )));
        }
        store.force_insert(pulled, &history, Some(session.remote_key()))?;
        Ok(())
    }
}

#[async_trait]
impl ReplicationDirection for PullReplication {
    fn is_push(&self) -> bool {
        false
    }

    fn maybe_create_remote_target(&self, _session: &ReplicationSession) {}

    fn begin_replicating(&self, session: &ReplicationSession) {
        let config = session.config().change_tracker(session.last_sequence());
        let remote = session.remote();
        let listener = Arc::new(PullListener {
            session: session.downgrade(),
            state: Arc::clone(&self.state),
        });
        let tracker = Arc::new(
            ChangeTracker::new(remote.url().clone(), config, remote.client(), listener)
                .with_headers(remote.headers()),
        );

        debug!(session = ?session.session_id(), mode = %tracker.mode(), "starting change tracker");
        session.async_task_started();
        *self.state.tracker.lock() = Some(Arc::clone(&tracker));
        if let Err(e) = tracker.start() {
            warn!(session = ?session.session_id(), error = %e, "change tracker failed to start");
        }
    }

    async fn process_inbox(&self, session: &ReplicationSession, inbox: RevisionList) {
        let Some(store) = session.store() else {
            return;
        };
        session.add_changes_total(inbox.len());

        let mut completed = Vec::new();
        for rev in inbox.iter() {
            let result = match store.contains_revision(rev) {
                Ok(true) => Ok(()),
                Ok(false) => Self::pull_revision(session, &*store, rev).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => completed.push(rev),
                Err(e) => {
                    warn!(session = ?session.session_id(), rev = %rev, error = %e, "failed to pull revision");
                    session.set_error(e);
                }
            }
        }

        let checkpoint = {
            let mut pending = self.state.pending.lock();
            for rev in &completed {
                if let Some(token) = rev.remote_sequence() {
                    pending.complete(token);
                }
            }
            pending.checkpoint()
        };
        if let Some(sequence) = checkpoint {
            session.set_last_sequence(sequence);
        }
        session.add_changes_processed(completed.len());
    }

    fn stopping(&self, _session: &ReplicationSession) {
        let tracker = self.state.tracker.lock().take();
        if let Some(tracker) = tracker {
            tracker.stop();
        }
    }
}

/// Feeds change-tracker events into a pull session.
struct PullListener {
    session: WeakSession,
    state: Arc<PullState>,
}

impl ChangeTrackerClient for PullListener {
    fn changed(&self, change: ChangeEntry) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let revisions = change.revisions();
        let token = change.seq_token();
        let checkpoint = {
            let mut pending = self.state.pending.lock();
            pending.add(token, revisions.len());
            pending.checkpoint()
        };
        if let Some(sequence) = checkpoint {
            session.set_last_sequence(sequence);
        }
        session.add_all_to_inbox(RevisionList::from(revisions));
    }

    fn tracker_stopped(&self, error: Option<SyncError>) {
        self.state.tracker.lock().take();
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if let Some(error) = error {
            session.set_error(error);
        }
        session.async_task_finished(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_waits_for_earlier_sequences() {
        let mut pending = PendingSequences::new();
        pending.add("1", 1);
        pending.add("2", 2);
        pending.add("3", 1);
        assert_eq!(pending.checkpoint(), None);

        pending.complete("3");
        assert_eq!(pending.checkpoint(), None);

        pending.complete("1");
        assert_eq!(pending.checkpoint().as_deref(), Some("1"));

        pending.complete("2");
        assert_eq!(pending.checkpoint(), None);
        pending.complete("2");
        assert_eq!(pending.checkpoint().as_deref(), Some("3"));
        assert!(pending.is_empty());
    }

    #[test]
    fn empty_changes_complete_immediately() {
        let mut pending = PendingSequences::new();
        pending.add("7", 0);
        assert_eq!(pending.checkpoint().as_deref(), Some("7"));
        pending.complete("unknown");
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn repeated_sequence_merges_into_the_outstanding_one() {
        let mut pending = PendingSequences::new();
        pending.add("1", 1);
        pending.add("2", 1);
        pending.add("1", 1);
        assert_eq!(pending.len(), 2);

        pending.complete("1");
        pending.complete("2");
        assert_eq!(pending.checkpoint(), None);
        pending.complete("1");
        assert_eq!(pending.checkpoint().as_deref(), Some("2"));
        assert!(pending.is_empty());
    }
}
