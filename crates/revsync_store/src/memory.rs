//! In-memory local store.

use crate::error::{StoreError, StoreResult};
use crate::log::ReplicationLog;
use crate::store::{ChangeNotification, ContentOptions, LocalStore, RevisionFilter};
use parking_lot::{Mutex, RwLock};
use revsync_protocol::{generation_from_rev_id, Properties, Revision, RevisionList};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

type LogKey = (String, bool);

/// An in-memory revision store.
///
/// This store keeps every document revision, the replication logs and the
/// checkpoint anchors in memory and is suitable for:
/// - Unit and integration tests of the replication engine
/// - Command-line tools that replicate a document set they loaded themselves
///
/// Each document keeps its revision tree as a list of revisions with
/// parent links. The current revision is the winning leaf: live revisions
/// beat deletions, then higher generations, then higher revision ids.
///
/// # Thread Safety
///
/// All state sits behind one lock; change notifications are sent while it
/// is held, so subscribers observe commit order.
///
/// # Example
///
/// ```rust
/// use revsync_store::{LocalStore, MemoryStore};
///
/// let store = MemoryStore::new();
/// let rev = store.put("doc", serde_json::Map::new()).unwrap();
/// store.log_revision("http://remote/db", true, &rev).unwrap();
/// assert_eq!(store.pending_revisions("http://remote/db", true).unwrap().len(), 1);
/// ```
pub struct MemoryStore {
    private_uuid: String,
    state: Mutex<State>,
    filters: RwLock<HashMap<String, RevisionFilter>>,
    subscribers: Mutex<Vec<UnboundedSender<ChangeNotification>>>,
}

#[derive(Default)]
struct State {
    docs: BTreeMap<String, Vec<StoredRevision>>,
    last_sequence: u64,
    logs: HashMap<LogKey, ReplicationLog>,
    anchors: HashMap<LogKey, String>,
    transaction: Option<Transaction>,
}

struct Transaction {
    depth: usize,
    rollback: bool,
    logs: HashMap<LogKey, ReplicationLog>,
    anchors: HashMap<LogKey, String>,
}

#[derive(Clone)]
struct StoredRevision {
    rev: Revision,
    parent: Option<String>,
}

impl MemoryStore {
    /// Creates an empty store with a random private UUID.
    pub fn new() -> Self {
        Self::with_private_uuid(uuid::Uuid::new_v4().to_string())
    }

    /// Creates an empty store with the given private UUID.
    pub fn with_private_uuid(private_uuid: impl Into<String>) -> Self {
        Self {
            private_uuid: private_uuid.into(),
            state: Mutex::new(State::default()),
            filters: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a named filter.
    pub fn register_filter(&self, name: impl Into<String>, filter: RevisionFilter) {
        self.filters.write().insert(name.into(), filter);
    }

    /// Creates or updates a document, returning the new revision.
    pub fn put(&self, doc_id: &str, mut body: Properties) -> StoreResult<Revision> {
        for key in ["_id", "_rev", "_revisions", "_deleted"] {
            body.remove(key);
        }
        self.write_revision(doc_id, body, false)
    }

    /// Deletes a document, returning the tombstone revision.
    pub fn delete(&self, doc_id: &str) -> StoreResult<Revision> {
        let live = {
            let state = self.state.lock();
            state
                .docs
                .get(doc_id)
                .and_then(|revs| winner(revs))
                .is_some_and(|stored| !stored.rev.is_deleted())
        };
        if !live {
            return Err(StoreError::NotFound(doc_id.to_string()));
        }
        self.write_revision(doc_id, Properties::new(), true)
    }

    /// Returns the current revision of a document, with its body.
    pub fn get(&self, doc_id: &str) -> Option<Revision> {
        let state = self.state.lock();
        state
            .docs
            .get(doc_id)
            .and_then(|revs| winner(revs))
            .map(|stored| stored.rev.clone())
    }

    /// Returns the number of documents (including deleted ones).
    pub fn document_count(&self) -> usize {
        self.state.lock().docs.len()
    }

    /// Returns the highest sequence assigned so far.
    pub fn last_sequence(&self) -> u64 {
        self.state.lock().last_sequence
    }

    /// Returns the number of replication-log entries for a remote.
    pub fn log_len(&self, remote: &str, push: bool) -> usize {
        self.state
            .lock()
            .logs
            .get(&(remote.to_string(), push))
            .map_or(0, ReplicationLog::len)
    }

    /// Returns true if a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.state.lock().transaction.is_some()
    }

    fn write_revision(
        &self,
        doc_id: &str,
        mut body: Properties,
        deleted: bool,
    ) -> StoreResult<Revision> {
        let mut state = self.state.lock();
        let parent = state
            .docs
            .get(doc_id)
            .and_then(|revs| winner(revs))
            .map(|stored| stored.rev.rev_id().to_string());
        let generation = parent.as_deref().map_or(0, generation_from_rev_id) + 1;
        let rev_id = format!(
            "{generation}-{}",
            revision_digest(parent.as_deref(), &body, deleted)
        );

        body.insert("_id".into(), Value::String(doc_id.to_string()));
        body.insert("_rev".into(), Value::String(rev_id.clone()));
        if deleted {
            body.insert("_deleted".into(), Value::Bool(true));
        }

        state.last_sequence += 1;
        let rev = Revision::new(doc_id, rev_id, deleted)
            .with_sequence(state.last_sequence)
            .with_body(body);
        state
            .docs
            .entry(doc_id.to_string())
            .or_default()
            .push(StoredRevision {
                rev: rev.clone(),
                parent,
            });

        trace!(rev = %rev, sequence = rev.sequence(), "stored revision");
        self.notify(&rev, None);
        Ok(rev)
    }

    fn notify(&self, rev: &Revision, source: Option<&str>) {
        let notification = ChangeNotification {
            rev: Revision::new(rev.doc_id(), rev.rev_id(), rev.is_deleted())
                .with_sequence(rev.sequence()),
            source: source.map(str::to_string),
        };
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    fn find<'a>(state: &'a State, rev: &Revision) -> Option<&'a StoredRevision> {
        state
            .docs
            .get(rev.doc_id())?
            .iter()
            .find(|stored| stored.rev.rev_id() == rev.rev_id())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Picks the winning leaf of a document's revision tree.
fn winner(revs: &[StoredRevision]) -> Option<&StoredRevision> {
    leaves(revs).max_by(|a, b| {
        let key = |s: &StoredRevision| (!s.rev.is_deleted(), s.rev.generation());
        key(a)
            .cmp(&key(b))
            .then_with(|| a.rev.rev_id().cmp(b.rev.rev_id()))
    })
}

fn leaves(revs: &[StoredRevision]) -> impl Iterator<Item = &StoredRevision> {
    revs.iter().filter(move |candidate| {
        candidate.rev.sequence() > 0
            && !revs
                .iter()
                .any(|other| other.parent.as_deref() == Some(candidate.rev.rev_id()))
    })
}

fn revision_digest(parent: Option<&str>, body: &Properties, deleted: bool) -> String {
    let mut hasher = Sha1::new();
    hasher.update(parent.unwrap_or_default().as_bytes());
    hasher.update(b"\n");
    hasher.update(if deleted { b"1" } else { b"0" });
    hasher.update(Value::Object(body.clone()).to_string().as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(32);
    digest
}

impl LocalStore for MemoryStore {
    fn private_uuid(&self) -> String {
        self.private_uuid.clone()
    }

    fn changes_since(
        &self,
        sequence: u64,
        filter: Option<&RevisionFilter>,
    ) -> StoreResult<RevisionList> {
        let state = self.state.lock();
        let mut changes: RevisionList = state
            .docs
            .values()
            .flat_map(|revs| leaves(revs))
            .filter(|stored| stored.rev.sequence() > sequence)
            .map(|stored| {
                Revision::new(
                    stored.rev.doc_id(),
                    stored.rev.rev_id(),
                    stored.rev.is_deleted(),
                )
                .with_sequence(stored.rev.sequence())
            })
            .filter(|rev| filter.map_or(true, |f| f(rev)))
            .collect();
        changes.sort_by_sequence();
        Ok(changes)
    }

    fn load_revision_body(
        &self,
        rev: &Revision,
        options: ContentOptions,
    ) -> StoreResult<Revision> {
        let state = self.state.lock();
        let stored = Self::find(&state, rev)
            .ok_or_else(|| StoreError::revision_not_found(rev.doc_id(), rev.rev_id()))?;
        let mut body = stored
            .rev
            .body()
            .cloned()
            .ok_or_else(|| StoreError::revision_not_found(rev.doc_id(), rev.rev_id()))?;
        if !options.include_attachments {
            body.remove("_attachments");
        }
        Ok(stored.rev.clone().with_body(body))
    }

    fn revision_history(&self, rev: &Revision) -> StoreResult<Vec<String>> {
        let state = self.state.lock();
        let revs = state
            .docs
            .get(rev.doc_id())
            .ok_or_else(|| StoreError::NotFound(rev.doc_id().to_string()))?;

        let mut history = Vec::new();
        let mut current = Some(rev.rev_id().to_string());
        while let Some(rev_id) = current {
            let stored = revs
                .iter()
                .find(|stored| stored.rev.rev_id() == rev_id)
                .ok_or_else(|| StoreError::revision_not_found(rev.doc_id(), &rev_id))?;
            current = stored.parent.clone();
            history.push(rev_id);
            if history.len() > revs.len() {
                return Err(StoreError::Corrupted(format!(
                    "revision cycle in {}",
                    rev.doc_id()
                )));
            }
        }
        Ok(history)
    }

    fn contains_revision(&self, rev: &Revision) -> StoreResult<bool> {
        Ok(Self::find(&self.state.lock(), rev).is_some_and(|stored| stored.rev.sequence() > 0))
    }

    fn force_insert(
        &self,
        rev: Revision,
        history: &[String],
        source: Option<&str>,
    ) -> StoreResult<Revision> {
        let fallback = [rev.rev_id().to_string()];
        let history = if history.is_empty() {
            &fallback[..]
        } else {
            history
        };
        if history[0] != rev.rev_id() {
            return Err(StoreError::Corrupted(format!(
                "history of {rev} starts at {}",
                history[0]
            )));
        }

        let mut state = self.state.lock();
        if let Some(existing) = Self::find(&state, &rev).filter(|s| s.rev.sequence() > 0) {
            return Ok(existing.rev.clone());
        }

        state.last_sequence += 1;
        let sequence = state.last_sequence;
        let doc_id = rev.doc_id().to_string();
        let deleted = rev.is_deleted();
        let mut body = rev.body().cloned().unwrap_or_default();
        body.remove("_revisions");
        body.insert("_id".into(), Value::String(doc_id.clone()));
        body.insert("_rev".into(), Value::String(rev.rev_id().to_string()));
        if deleted {
            body.insert("_deleted".into(), Value::Bool(true));
        }

        let revs = state.docs.entry(doc_id.clone()).or_default();
        let mut inserted = None;
        for (i, rev_id) in history.iter().enumerate().rev() {
            let parent = history.get(i + 1).cloned();
            if i == 0 {
                let leaf = Revision::new(doc_id.clone(), rev_id.clone(), deleted)
                    .with_sequence(sequence)
                    .with_body(body.clone());
                // An ancestor stub with this id may already exist.
                revs.retain(|stored| stored.rev.rev_id() != rev_id);
                revs.push(StoredRevision {
                    rev: leaf.clone(),
                    parent,
                });
                inserted = Some(leaf);
            } else if !revs.iter().any(|stored| stored.rev.rev_id() == rev_id) {
                revs.push(StoredRevision {
                    rev: Revision::new(doc_id.clone(), rev_id.clone(), false),
                    parent,
                });
            }
        }

        let inserted = inserted.ok_or_else(|| StoreError::Corrupted("empty history".into()))?;
        debug!(rev = %inserted, source = ?source, "inserted replicated revision");
        self.notify(&inserted, source);
        Ok(inserted)
    }

    fn filter_named(&self, name: &str) -> Option<RevisionFilter> {
        self.filters.read().get(name).cloned()
    }

    fn log_revision(&self, remote: &str, push: bool, rev: &Revision) -> StoreResult<()> {
        self.state
            .lock()
            .logs
            .entry((remote.to_string(), push))
            .or_default()
            .log(rev.clone());
        Ok(())
    }

    fn update_log_revision(
        &self,
        remote: &str,
        push: bool,
        rev: &Revision,
        attempted_at: i64,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let updated = state
            .logs
            .get_mut(&(remote.to_string(), push))
            .is_some_and(|log| log.mark_attempted(rev, attempted_at));
        if !updated {
            trace!(rev = %rev, "attempt mark for unlogged revision ignored");
        }
        Ok(())
    }

    fn remove_log_for_revision(
        &self,
        remote: &str,
        push: bool,
        rev: &Revision,
    ) -> StoreResult<()> {
        if let Some(log) = self.state.lock().logs.get_mut(&(remote.to_string(), push)) {
            log.remove(rev);
        }
        Ok(())
    }

    fn reset_revisions(&self, remote: &str, push: bool) -> StoreResult<()> {
        if let Some(log) = self.state.lock().logs.get_mut(&(remote.to_string(), push)) {
            log.reset();
        }
        Ok(())
    }

    fn pending_revisions(&self, remote: &str, push: bool) -> StoreResult<RevisionList> {
        Ok(self
            .state
            .lock()
            .logs
            .get(&(remote.to_string(), push))
            .map(ReplicationLog::pending)
            .unwrap_or_default())
    }

    fn last_sequence_with_remote(&self, remote: &str, push: bool) -> StoreResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .anchors
            .get(&(remote.to_string(), push))
            .cloned())
    }

    fn set_last_sequence(&self, sequence: &str, remote: &str, push: bool) -> StoreResult<()> {
        self.state
            .lock()
            .anchors
            .insert((remote.to_string(), push), sequence.to_string());
        Ok(())
    }

    fn begin_transaction(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        match state.transaction.as_mut() {
            Some(txn) => txn.depth += 1,
            None => {
                let txn = Transaction {
                    depth: 1,
                    rollback: false,
                    logs: state.logs.clone(),
                    anchors: state.anchors.clone(),
                };
                state.transaction = Some(txn);
            }
        }
        Ok(())
    }

    fn end_transaction(&self, commit: bool) -> StoreResult<()> {
        let mut state = self.state.lock();
        let txn = state
            .transaction
            .as_mut()
            .ok_or_else(|| StoreError::Transaction("no transaction in progress".into()))?;
        txn.depth -= 1;
        txn.rollback |= !commit;
        if txn.depth > 0 {
            return Ok(());
        }

        if let Some(txn) = state.transaction.take() {
            if txn.rollback {
                debug!("rolling back replication log changes");
                state.logs = txn.logs;
                state.anchors = txn.anchors;
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> UnboundedReceiver<ChangeNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}
