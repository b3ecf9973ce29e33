//! Push replication: local store → remote database.

use crate::error::{SyncError, SyncResult};
use crate::session::{with_transaction, ReplicationDirection, ReplicationSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use revsync_protocol::{BulkDocsRequest, Properties, Revision, RevisionHistory, RevisionList};
use revsync_store::{ChangeNotification, ContentOptions, LocalStore, RevisionFilter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pushes local revisions the remote is missing.
///
/// For each inbox batch the remote is asked which revisions it lacks
/// (`_revs_diff`); those are uploaded with their ancestry through
/// `_bulk_docs` with `new_edits=false`. Replication-log entries are removed
/// only once the remote confirmed the revisions.
#[derive(Default)]
pub struct PushReplication {
    creating_target: Arc<AtomicBool>,
    target_created: Arc<AtomicBool>,
    filter: Mutex<Option<RevisionFilter>>,
    observer: Mutex<Option<JoinHandle<()>>>,
    observing: Arc<AtomicBool>,
}

impl PushReplication {
    /// Creates a push direction.
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve_filter(&self, session: &ReplicationSession, store: &dyn LocalStore) -> Option<RevisionFilter> {
        let name = session.config().filter_name.as_deref()?;
        let filter = store.filter_named(name);
        if filter.is_none() {
            warn!(session = ?session.session_id(), filter = name, "filter not found, pushing unfiltered");
        }
        *self.filter.lock() = filter.clone();
        filter
    }

    /// Logs local changes committed after sequence `scanned` as they arrive.
    fn observe(
        &self,
        session: &ReplicationSession,
        mut notifications: UnboundedReceiver<ChangeNotification>,
        scanned: u64,
    ) {
        self.observing.store(true, Ordering::SeqCst);
        session.async_task_started();

        let observing = Arc::clone(&self.observing);
        let filter = self.filter.lock().clone();
        let weak = session.downgrade();
        let handle = session.spawn_work(async move {
            while let Some(notification) = notifications.recv().await {
                if notification.rev.sequence() <= scanned {
                    continue;
                }
                match weak.upgrade() {
                    Some(session) => local_change(&session, filter.as_ref(), notification),
                    None => return,
                }
            }
            // The store went away; release the observer's task slot.
            if observing.swap(false, Ordering::SeqCst) {
                if let Some(session) = weak.upgrade() {
                    session.async_task_finished(1);
                }
            }
        });
        *self.observer.lock() = Some(handle);
    }

    fn remove_from_log(session: &ReplicationSession, store: &dyn LocalStore, revs: &[&Revision]) {
        if revs.is_empty() {
            return;
        }
        let remote = session.remote_key();
        let result = with_transaction(store, |s| {
            revs.iter()
                .try_for_each(|rev| s.remove_log_for_revision(remote, true, rev))
        });
        if let Err(e) = result {
            warn!(session = ?session.session_id(), error = %e, "failed to update replication log");
            session.set_error(e.into());
        }
    }
}

fn local_change(
    session: &ReplicationSession,
    filter: Option<&RevisionFilter>,
    notification: ChangeNotification,
) {
    let ChangeNotification { rev, source } = notification;
    if source.as_deref() == Some(session.remote_key()) {
        return;
    }
    if filter.is_some_and(|f| !f(&rev)) {
        return;
    }
    let Some(store) = session.store() else {
        return;
    };
    if let Err(e) = store.log_revision(session.remote_key(), true, &rev) {
        warn!(session = ?session.session_id(), rev = %rev, error = %e, "failed to log local change");
        return;
    }
    session.set_last_sequence(rev.sequence().to_string());
    session.schedule_refill();
}

/// Builds the upload body of a revision: its content (or a tombstone)
/// plus its `_revisions` ancestry.
fn upload_body(store: &dyn LocalStore, rev: &Revision) -> SyncResult<Properties> {
    let mut body = if rev.is_deleted() {
        rev.tombstone_properties()
    } else {
        store
            .load_revision_body(rev, ContentOptions::with_attachments())
            .map_err(|e| SyncError::LocalLoadFailure {
                doc_id: rev.doc_id().to_string(),
                rev_id: rev.rev_id().to_string(),
                message: e.to_string(),
            })?
            .take_body()
            .unwrap_or_default()
    };

    let history = store.revision_history(rev)?;
    let revisions = RevisionHistory::from_rev_ids(&history)?;
    body.insert("_revisions".into(), revisions.to_value());
    Ok(body)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[async_trait]
impl ReplicationDirection for PushReplication {
    fn is_push(&self) -> bool {
        true
    }

    fn maybe_create_remote_target(&self, session: &ReplicationSession) {
        if !session.config().create_target
            || self.target_created.load(Ordering::SeqCst)
            || self.creating_target.swap(true, Ordering::SeqCst)
        {
            return;
        }

        session.async_task_started();
        let creating = Arc::clone(&self.creating_target);
        let created = Arc::clone(&self.target_created);
        let session = session.clone();
        let remote = session.remote().clone();
        session.clone().spawn_work(async move {
            let result = session.run_io(async move { remote.create_database().await }).await;
            creating.store(false, Ordering::SeqCst);
            match result {
                Ok(()) | Err(SyncError::ConflictOrPrecondition) => {
                    debug!(session = ?session.session_id(), "remote database ready");
                    created.store(true, Ordering::SeqCst);
                    session.begin_replicating();
                }
                Err(e) => {
                    warn!(session = ?session.session_id(), error = %e, "failed to create remote database");
                    session.abort(e);
                }
            }
            session.async_task_finished(1);
        });
    }

    fn begin_replicating(&self, session: &ReplicationSession) {
        if self.creating_target.load(Ordering::SeqCst) {
            debug!(session = ?session.session_id(), "waiting for remote database creation");
            return;
        }
        let Some(store) = session.store() else {
            return;
        };

        let filter = self.resolve_filter(session, &*store);
        let since = match session.last_sequence() {
            Some(seq) => seq.parse::<u64>().unwrap_or_else(|_| {
                warn!(session = ?session.session_id(), sequence = %seq, "unparseable local sequence, starting over");
                0
            }),
            None => 0,
        };

        // Subscribe before scanning so commits racing the scan still arrive.
        let notifications = session.is_continuous().then(|| store.subscribe());
        let changes = match store.changes_since(since, filter.as_ref()) {
            Ok(changes) => changes,
            Err(e) => {
                session.abort(e.into());
                return;
            }
        };
        let scanned = changes.max_sequence().unwrap_or(since);
        if !changes.is_empty() {
            let remote = session.remote_key();
            let logged = with_transaction(&*store, |s| {
                changes.iter().try_for_each(|rev| s.log_revision(remote, true, rev))
            });
            if let Err(e) = logged {
                session.abort(e.into());
                return;
            }
            info!(session = ?session.session_id(), count = changes.len(), since, "logged local changes");
            if let Some(max) = changes.max_sequence() {
                session.set_last_sequence(max.to_string());
            }
        }

        if let Some(notifications) = notifications {
            self.observe(session, notifications, scanned);
        }
        session.schedule_refill();
    }

    async fn process_inbox(&self, session: &ReplicationSession, inbox: RevisionList) {
        if inbox.is_empty() {
            session.schedule_refill();
            return;
        }
        let Some(store) = session.store() else {
            return;
        };
        let remote_key = session.remote_key().to_string();

        let now = now_millis();
        for rev in inbox.iter() {
            if let Err(e) = store.update_log_revision(&remote_key, true, rev, now) {
                warn!(session = ?session.session_id(), rev = %rev, error = %e, "failed to mark revision attempted");
            }
        }
        session.refill_consumed();

        let remote = session.remote().clone();
        let diff_request = inbox.to_revs_diff();
        let diff = match session
            .run_io(async move { remote.revs_diff(&diff_request).await })
            .await
        {
            Ok(diff) => diff,
            Err(e) => {
                warn!(session = ?session.session_id(), error = %e, "_revs_diff failed");
                session.abort(e);
                return;
            }
        };

        if diff.is_empty() {
            debug!(session = ?session.session_id(), count = inbox.len(), "remote has every revision");
            let all: Vec<&Revision> = inbox.iter().collect();
            Self::remove_from_log(session, &*store, &all);
            session.schedule_refill();
            return;
        }

        let mut confirmed: Vec<&Revision> = Vec::new();
        let mut docs = Vec::new();
        for rev in inbox.iter() {
            if !diff.is_missing(rev.doc_id(), rev.rev_id()) {
                confirmed.push(rev);
                continue;
            }
            match upload_body(&*store, rev) {
                Ok(body) => {
                    docs.push(body);
                    confirmed.push(rev);
                }
                Err(e) => {
                    warn!(session = ?session.session_id(), rev = %rev, error = %e, "skipping unreadable revision");
                }
            }
        }

        if !docs.is_empty() {
            let count = docs.len();
            session.add_changes_total(count);
            let remote = session.remote().clone();
            let request = BulkDocsRequest::replicated(docs);
            match session
                .run_io(async move { remote.bulk_docs(&request).await })
                .await
            {
                Ok(()) => {
                    info!(session = ?session.session_id(), count, "uploaded revisions");
                    Self::remove_from_log(session, &*store, &confirmed);
                    session.add_changes_processed(count);
                }
                Err(e) => {
                    warn!(session = ?session.session_id(), count, error = %e, "_bulk_docs failed");
                    session.set_error(e);
                }
            }
        } else {
            Self::remove_from_log(session, &*store, &confirmed);
        }

        session.schedule_refill();
    }

    fn stopping(&self, session: &ReplicationSession) {
        if let Some(handle) = self.observer.lock().take() {
            handle.abort();
        }
        if self.observing.swap(false, Ordering::SeqCst) {
            session.async_task_finished(1);
        }
    }
}
