//! Replication session driver.
//!
//! A [`ReplicationSession`] runs one direction of replication between the
//! local store and a remote database:
//!
//! ```text
//! Stopped --start()--> Starting --begin_replicating()--> Replicating
//!    ^                                                        |
//!    +------ all async tasks done <-- Draining <-- stop() ----+
//! ```
//!
//! Direction-specific work is delegated to a [`ReplicationDirection`]
//! (push or pull). The session owns everything they share: checkpoint
//! fetch and debounced save, the inbox [`Batcher`], async-task accounting,
//! refills from the replication log, and progress reporting.
//!
//! ## Async tasks
//!
//! Every outstanding network operation and every revision waiting in the
//! inbox counts as one async task. A non-continuous session stops by itself
//! when the count drops to zero.

use crate::batcher::{BatchProcessor, Batcher};
use crate::config::ReplicationConfig;
use crate::error::{SyncError, SyncResult};
use crate::http::RemoteDatabase;
use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use revsync_protocol::{checkpoint_doc_id, Checkpoint, Revision, RevisionList};
use revsync_store::{LocalStore, StoreResult};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Sessions currently running, shared with the factory that created them.
pub(crate) type ActiveSessions = Arc<Mutex<Vec<ReplicationSession>>>;

/// Direction-specific replication behavior.
#[async_trait]
pub trait ReplicationDirection: Send + Sync {
    /// Returns true for local → remote replication.
    fn is_push(&self) -> bool;

    /// Creates the remote database if the direction requires it.
    fn maybe_create_remote_target(&self, session: &ReplicationSession);

    /// Starts feeding revisions into the session's inbox.
    fn begin_replicating(&self, session: &ReplicationSession);

    /// Replicates one batch of revisions.
    async fn process_inbox(&self, session: &ReplicationSession, inbox: RevisionList);

    /// Releases live resources (observers, trackers) when the session stops.
    fn stopping(&self, _session: &ReplicationSession) {}
}

/// Runtime handles used by sessions.
#[derive(Debug, Clone)]
pub struct Runtimes {
    /// Scheduler for batching, refills and checkpoint timers.
    pub work: Handle,
    /// Runtime on which network requests run.
    pub io: Handle,
}

impl Runtimes {
    /// Uses one runtime for everything.
    pub fn new(handle: Handle) -> Self {
        Self {
            work: handle.clone(),
            io: handle,
        }
    }

    /// Uses separate work and I/O runtimes.
    pub fn split(work: Handle, io: Handle) -> Self {
        Self { work, io }
    }

    /// Uses the runtime of the calling task.
    pub fn current() -> SyncResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| SyncError::NoRuntime(e.to_string()))
    }
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// Not running.
    Stopped,
    /// Fetching the remote checkpoint.
    Starting,
    /// Replicating.
    Replicating,
    /// Stop requested; waiting for outstanding work.
    Draining,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Stopped => "stopped",
            SessionPhase::Starting => "starting",
            SessionPhase::Replicating => "replicating",
            SessionPhase::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// Snapshot of a session's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    /// Session id (`repl001`, ...), once started.
    pub session_id: Option<String>,
    /// Lifecycle phase.
    pub phase: SessionPhase,
    /// Revisions replicated so far.
    pub changes_processed: u64,
    /// Revisions scheduled for replication so far.
    pub changes_total: u64,
    /// Last recorded error.
    pub error: Option<SyncError>,
    /// Current checkpoint sequence.
    pub last_sequence: Option<String>,
}

#[derive(Debug)]
struct SessionState {
    running: bool,
    active: bool,
    continuous: bool,
    stopping: bool,
    last_sequence: Option<String>,
    last_sequence_changed: bool,
    remote_checkpoint: Option<Checkpoint>,
    checkpoint_id: Option<String>,
    save_scheduled: bool,
    saving_checkpoint: bool,
    overdue_for_save: bool,
    async_task_count: usize,
    error: Option<SyncError>,
    session_id: Option<String>,
    phase: SessionPhase,
    changes_processed: u64,
    changes_total: u64,
    inbox: HashSet<Revision>,
}

impl SessionState {
    fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            phase: self.phase,
            changes_processed: self.changes_processed,
            changes_total: self.changes_total,
            error: self.error.clone(),
            last_sequence: self.last_sequence.clone(),
        }
    }
}

/// Handle to one replication session.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct ReplicationSession {
    inner: Arc<SessionInner>,
}

/// A handle that does not keep the session alive.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    /// Returns the session if it still exists.
    pub fn upgrade(&self) -> Option<ReplicationSession> {
        self.inner.upgrade().map(|inner| ReplicationSession { inner })
    }
}

struct SessionInner {
    direction: Arc<dyn ReplicationDirection>,
    config: ReplicationConfig,
    remote: RemoteDatabase,
    store: RwLock<Option<Arc<dyn LocalStore>>>,
    runtimes: Runtimes,
    batcher: Batcher<Revision>,
    state: Mutex<SessionState>,
    refill_scheduled: AtomicBool,
    progress: watch::Sender<SessionStatus>,
    checkpoint_saved: Notify,
    session_ids: Arc<AtomicU64>,
    active: Weak<Mutex<Vec<ReplicationSession>>>,
}

impl ReplicationSession {
    pub(crate) fn new(
        direction: Arc<dyn ReplicationDirection>,
        store: Arc<dyn LocalStore>,
        remote: RemoteDatabase,
        config: ReplicationConfig,
        runtimes: Runtimes,
        session_ids: Arc<AtomicU64>,
        active: &ActiveSessions,
    ) -> Self {
        let state = SessionState {
            running: false,
            active: false,
            continuous: config.continuous,
            stopping: false,
            last_sequence: None,
            last_sequence_changed: false,
            remote_checkpoint: None,
            checkpoint_id: None,
            save_scheduled: false,
            saving_checkpoint: false,
            overdue_for_save: false,
            async_task_count: 0,
            error: None,
            session_id: None,
            phase: SessionPhase::Stopped,
            changes_processed: 0,
            changes_total: 0,
            inbox: HashSet::new(),
        };
        let (progress, _) = watch::channel(state.status());

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let weak = weak.clone();
            let processor: BatchProcessor<Revision> = Arc::new(move |batch| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        ReplicationSession { inner }
                            .process_batch(RevisionList::from(batch))
                            .await;
                    }
                }
                .boxed()
            });

            SessionInner {
                batcher: Batcher::new(config.batch, runtimes.work.clone(), processor),
                direction,
                config,
                remote,
                store: RwLock::new(Some(store)),
                runtimes,
                state: Mutex::new(state),
                refill_scheduled: AtomicBool::new(false),
                progress,
                checkpoint_saved: Notify::new(),
                session_ids,
                active: Arc::downgrade(active),
            }
        });

        Self { inner }
    }

    /// Returns a handle that does not keep the session alive.
    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // --- accessors ---

    /// Returns the session configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.inner.config
    }

    /// Returns the remote database.
    pub fn remote(&self) -> &RemoteDatabase {
        &self.inner.remote
    }

    /// Returns the key identifying the remote in the replication log.
    pub fn remote_key(&self) -> &str {
        &self.inner.config.remote_url
    }

    /// Returns true for push sessions.
    pub fn is_push(&self) -> bool {
        self.inner.direction.is_push()
    }

    /// Returns the local store, until the session has stopped.
    pub fn store(&self) -> Option<Arc<dyn LocalStore>> {
        self.inner.store.read().clone()
    }

    /// Returns true between `start()` and `stopped()`.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Returns true while the session is replicating or draining work.
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    /// Returns true if the session keeps replicating after catching up.
    pub fn is_continuous(&self) -> bool {
        self.inner.state.lock().continuous
    }

    /// Returns the session id, once started.
    pub fn session_id(&self) -> Option<String> {
        self.inner.state.lock().session_id.clone()
    }

    /// Returns the last recorded error.
    pub fn error(&self) -> Option<SyncError> {
        self.inner.state.lock().error.clone()
    }

    /// Returns the current checkpoint sequence.
    pub fn last_sequence(&self) -> Option<String> {
        self.inner.state.lock().last_sequence.clone()
    }

    /// Returns the checkpoint document last fetched from or saved to the remote.
    pub fn remote_checkpoint(&self) -> Option<Checkpoint> {
        self.inner.state.lock().remote_checkpoint.clone()
    }

    /// Returns the checkpoint document id, once started.
    pub fn checkpoint_id(&self) -> Option<String> {
        self.inner.state.lock().checkpoint_id.clone()
    }

    /// Returns the number of outstanding async tasks.
    pub fn async_task_count(&self) -> usize {
        self.inner.state.lock().async_task_count
    }

    /// Returns the number of revisions waiting in the inbox batcher.
    pub fn inbox_count(&self) -> usize {
        self.inner.batcher.count()
    }

    /// Returns a snapshot of the session's progress.
    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().status()
    }

    /// Subscribes to progress updates.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.progress.subscribe()
    }

    /// Resolves once the session is stopped.
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.inner.progress.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|status| status.phase == SessionPhase::Stopped).await;
    }

    fn publish(&self) {
        let status = self.inner.state.lock().status();
        self.inner.progress.send_replace(status);
    }

    fn label(&self) -> String {
        self.session_id().unwrap_or_else(|| "-".to_string())
    }

    // --- lifecycle ---

    /// Starts replicating. Does nothing if already running.
    pub fn start(&self) {
        let Some(store) = self.store() else {
            warn!(remote = %self.remote().masked_url(), "stopped sessions cannot be restarted");
            return;
        };

        let checkpoint_id = checkpoint_doc_id(&store.private_uuid(), self.remote_key(), self.is_push());
        let session_id = {
            let mut state = self.inner.state.lock();
            if state.running {
                return;
            }
            let n = self.inner.session_ids.fetch_add(1, Ordering::SeqCst) + 1;
            let session_id = format!("repl{n:03}");
            state.session_id = Some(session_id.clone());
            state.running = true;
            state.active = true;
            state.stopping = false;
            state.continuous = self.inner.config.continuous;
            state.last_sequence = None;
            state.last_sequence_changed = false;
            state.error = None;
            state.checkpoint_id = Some(checkpoint_id);
            state.phase = SessionPhase::Starting;
            session_id
        };

        if let Some(active) = self.inner.active.upgrade() {
            active.lock().push(self.clone());
        }
        info!(session = %session_id, "{} starting", self);
        self.publish();
        self.fetch_remote_checkpoint(&store);
    }

    fn fetch_remote_checkpoint(&self, store: &Arc<dyn LocalStore>) {
        let local_last = match store.last_sequence_with_remote(self.remote_key(), self.is_push()) {
            Ok(anchor) => anchor,
            Err(e) => {
                warn!(session = %self.label(), error = %e, "failed to read local checkpoint");
                self.abort(e.into());
                return;
            }
        };

        let Some(local_last) = local_last else {
            debug!(session = %self.label(), "no local checkpoint, replicating from the start");
            self.maybe_create_remote_target();
            self.begin_replicating();
            return;
        };

        let Some(checkpoint_id) = self.checkpoint_id() else {
            return;
        };
        self.async_task_started();
        let session = self.clone();
        self.spawn_work(async move {
            let remote = session.remote().clone();
            let result = session
                .run_io(async move { remote.get_checkpoint(&checkpoint_id).await })
                .await;

            match result {
                Ok(checkpoint) => {
                    let matches = checkpoint.last_sequence() == Some(local_last.as_str());
                    {
                        let mut state = session.inner.state.lock();
                        state.remote_checkpoint = Some(checkpoint);
                        if matches {
                            state.last_sequence = Some(local_last.clone());
                        }
                    }
                    if matches {
                        info!(session = %session.label(), sequence = %local_last, "resuming from checkpoint");
                    } else {
                        info!(session = %session.label(), local = %local_last, "remote checkpoint does not match, replicating from the start");
                    }
                    session.begin_replicating();
                }
                Err(SyncError::NotFoundRemote) => {
                    debug!(session = %session.label(), "no remote checkpoint");
                    session.maybe_create_remote_target();
                    session.begin_replicating();
                }
                Err(e) => {
                    warn!(session = %session.label(), error = %e, "failed to fetch remote checkpoint");
                    session.abort(e);
                }
            }
            session.async_task_finished(1);
        });
    }

    fn maybe_create_remote_target(&self) {
        let direction = Arc::clone(&self.inner.direction);
        direction.maybe_create_remote_target(self);
    }

    /// Hands control to the direction to start feeding the inbox.
    pub fn begin_replicating(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.running || state.stopping {
                return;
            }
            state.phase = SessionPhase::Replicating;
        }
        self.publish();
        let direction = Arc::clone(&self.inner.direction);
        direction.begin_replicating(self);
    }

    /// Requests a stop. Idempotent.
    ///
    /// The session drains queued revisions and outstanding async tasks
    /// before it is fully stopped.
    pub fn stop(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            if !state.running || state.stopping {
                return;
            }
            state.stopping = true;
            state.continuous = false;
            state.phase = SessionPhase::Draining;
            state.async_task_count == 0
        };
        info!(session = %self.label(), idle, "{} stopping", self);
        self.publish();

        let direction = Arc::clone(&self.inner.direction);
        direction.stopping(self);
        self.inner.batcher.flush();
        self.reset_revisions();

        if idle || self.async_task_count() == 0 {
            self.stopped();
        }
    }

    /// Records `error` and stops the session.
    pub fn abort(&self, error: SyncError) {
        self.set_error(error);
        self.stop();
    }

    /// Finalizes the session. Idempotent.
    ///
    /// The phase turns `Stopped` once the final checkpoint save completes.
    fn stopped(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.active = false;
            state.async_task_count = 0;
            state.changes_processed = 0;
            state.changes_total = 0;
            state.inbox.clear();
        }

        self.reset_revisions();
        let store = self.inner.store.write().take();
        if let Some(active) = self.inner.active.upgrade() {
            active
                .lock()
                .retain(|s| !Arc::ptr_eq(&s.inner, &self.inner));
        }

        let session = self.clone();
        self.spawn_work(async move {
            session.save_final_checkpoint(store).await;
            let error = {
                let mut state = session.inner.state.lock();
                state.phase = SessionPhase::Stopped;
                state.error.clone()
            };
            info!(session = %session.label(), error = ?error, "{} stopped", session);
            session.publish();
        });
    }

    fn reset_revisions(&self) {
        if let Some(store) = self.store() {
            if let Err(e) = store.reset_revisions(self.remote_key(), self.is_push()) {
                warn!(session = %self.label(), error = %e, "failed to reset replication log");
            }
        }
    }

    // --- errors and progress ---

    /// Records an error without stopping.
    pub fn set_error(&self, error: SyncError) {
        self.inner.state.lock().error = Some(error);
        self.publish();
    }

    /// Adds to the number of revisions scheduled for replication.
    pub fn add_changes_total(&self, n: usize) {
        self.inner.state.lock().changes_total += n as u64;
        self.publish();
    }

    /// Adds to the number of revisions replicated.
    pub fn add_changes_processed(&self, n: usize) {
        self.inner.state.lock().changes_processed += n as u64;
        self.publish();
    }

    // --- async tasks ---

    /// Counts one more outstanding async task.
    pub fn async_task_started(&self) {
        let mut state = self.inner.state.lock();
        state.async_task_count += 1;
        trace!(count = state.async_task_count, "async task started");
    }

    /// Counts `n` async tasks as finished, stopping a non-continuous
    /// session once none remain.
    pub fn async_task_finished(&self, n: usize) {
        let finished = {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.async_task_count = state.async_task_count.saturating_sub(n);
            trace!(count = state.async_task_count, "async task finished");
            state.async_task_count == 0 && !state.continuous
        };
        if finished {
            self.stopped();
        }
    }

    /// Spawns a task on the work scheduler.
    pub fn spawn_work<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.runtimes.work.spawn(future)
    }

    /// Runs a network operation on the I/O runtime.
    pub async fn run_io<T, F>(&self, future: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.inner
            .runtimes
            .io
            .spawn(future)
            .await
            .map_err(|_| SyncError::Cancelled)?
    }

    // --- inbox ---

    /// Queues one revision for replication.
    pub fn add_to_inbox(&self, rev: Revision) {
        self.add_all_to_inbox(RevisionList::from(vec![rev]));
    }

    /// Queues revisions for replication, skipping those already queued.
    pub fn add_all_to_inbox(&self, revs: RevisionList) {
        let fresh: Vec<Revision> = {
            let mut state = self.inner.state.lock();
            let fresh: Vec<Revision> = revs
                .into_iter()
                .filter(|rev| state.inbox.insert(rev.clone()))
                .collect();
            state.async_task_count += fresh.len();
            fresh
        };
        if !fresh.is_empty() {
            trace!(session = %self.label(), count = fresh.len(), "queued revisions");
            self.inner.batcher.queue_all(fresh);
        }
    }

    async fn process_batch(&self, inbox: RevisionList) {
        let count = inbox.len();
        debug!(session = %self.label(), count, "processing inbox");
        self.async_task_started();
        let direction = Arc::clone(&self.inner.direction);
        direction.process_inbox(self, inbox.clone()).await;
        {
            let mut state = self.inner.state.lock();
            for rev in inbox.iter() {
                state.inbox.remove(rev);
            }
        }
        self.async_task_finished(count + 1);
    }

    // --- refill ---

    /// Schedules loading pending revisions from the replication log into
    /// the inbox, unless a refill is already scheduled.
    pub fn schedule_refill(&self) {
        if self.inner.refill_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.async_task_started();
        let session = self.clone();
        self.spawn_work(async move {
            session.refill();
            session.async_task_finished(1);
        });
    }

    /// Clears the refill flag once queued revisions start processing.
    pub fn refill_consumed(&self) {
        self.inner.refill_scheduled.store(false, Ordering::SeqCst);
    }

    fn refill(&self) {
        let Some(store) = self.store() else {
            self.refill_consumed();
            return;
        };
        let pending = match store.pending_revisions(self.remote_key(), self.is_push()) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(session = %self.label(), error = %e, "failed to load pending revisions");
                self.refill_consumed();
                return;
            }
        };

        let fresh: RevisionList = {
            let state = self.inner.state.lock();
            pending
                .into_iter()
                .filter(|rev| !state.inbox.contains(rev))
                .collect()
        };
        if fresh.is_empty() {
            trace!(session = %self.label(), "nothing to refill");
            self.refill_consumed();
        } else {
            debug!(session = %self.label(), count = fresh.len(), "refilling inbox");
            self.add_all_to_inbox(fresh);
        }
    }

    // --- checkpoints ---

    /// Advances the checkpoint sequence and schedules a save.
    pub fn set_last_sequence(&self, sequence: impl Into<String>) {
        let sequence = sequence.into();
        {
            let mut state = self.inner.state.lock();
            if state.last_sequence.as_deref() == Some(sequence.as_str()) {
                return;
            }
            trace!(sequence = %sequence, "last sequence advanced");
            state.last_sequence = Some(sequence);
            state.last_sequence_changed = true;
        }
        self.publish();
        self.save_last_sequence_soon();
    }

    fn save_last_sequence_soon(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.save_scheduled {
                return;
            }
            state.save_scheduled = true;
        }
        let session = self.clone();
        let delay = self.inner.config.checkpoint_save_delay;
        self.spawn_work(async move {
            tokio::time::sleep(delay).await;
            session.inner.state.lock().save_scheduled = false;
            session.save_last_sequence();
        });
    }

    /// Saves a changed checkpoint now.
    ///
    /// At most one save is in flight; a save requested meanwhile runs as
    /// soon as the current one completes.
    pub fn save_last_sequence(&self) {
        let SaveStep::Ready(save) = self.claim_save() else {
            return;
        };
        self.record_local_checkpoint(self.store().as_deref(), &save.sequence);
        let session = self.clone();
        self.spawn_work(async move {
            session.write_checkpoint(save).await;
        });
    }

    /// Saves the checkpoint one last time, waiting for any save in flight.
    async fn save_final_checkpoint(&self, store: Option<Arc<dyn LocalStore>>) {
        loop {
            let saved = self.inner.checkpoint_saved.notified();
            match self.claim_save() {
                SaveStep::Idle => return,
                SaveStep::Busy => saved.await,
                SaveStep::Ready(save) => {
                    self.record_local_checkpoint(store.as_deref(), &save.sequence);
                    if !self.write_checkpoint(save).await {
                        return;
                    }
                }
            }
        }
    }

    fn claim_save(&self) -> SaveStep {
        let mut state = self.inner.state.lock();
        if state.saving_checkpoint {
            if state.last_sequence_changed {
                state.overdue_for_save = true;
            }
            return SaveStep::Busy;
        }
        if !state.last_sequence_changed {
            return SaveStep::Idle;
        }
        let (Some(sequence), Some(checkpoint_id)) =
            (state.last_sequence.clone(), state.checkpoint_id.clone())
        else {
            return SaveStep::Idle;
        };
        state.last_sequence_changed = false;
        state.overdue_for_save = false;
        state.saving_checkpoint = true;
        let mut checkpoint = state.remote_checkpoint.clone().unwrap_or_default();
        checkpoint.set_last_sequence(sequence.clone());
        SaveStep::Ready(PendingSave {
            checkpoint_id,
            checkpoint,
            sequence,
        })
    }

    fn record_local_checkpoint(&self, store: Option<&dyn LocalStore>, sequence: &str) {
        if let Some(store) = store {
            if let Err(e) = store.set_last_sequence(sequence, self.remote_key(), self.is_push()) {
                warn!(session = %self.label(), error = %e, "failed to record local checkpoint");
            }
        }
    }

    /// PUTs a claimed checkpoint. Returns false if the remote rejected it.
    async fn write_checkpoint(&self, save: PendingSave) -> bool {
        let PendingSave {
            checkpoint_id,
            checkpoint,
            sequence,
        } = save;
        debug!(session = %self.label(), sequence = %sequence, "saving checkpoint");
        let remote = self.remote().clone();
        let body = checkpoint.clone();
        let result = self
            .run_io(async move { remote.put_checkpoint(&checkpoint_id, &body).await })
            .await;

        let (saved, overdue) = {
            let mut state = self.inner.state.lock();
            state.saving_checkpoint = false;
            let saved = match result {
                Ok(rev) => {
                    let mut saved = checkpoint;
                    if let Some(rev) = rev {
                        saved.set_rev(rev);
                    }
                    state.remote_checkpoint = Some(saved);
                    true
                }
                Err(e) => {
                    warn!(session = ?state.session_id, error = %e, "failed to save checkpoint");
                    state.last_sequence_changed = true;
                    false
                }
            };
            (saved, std::mem::take(&mut state.overdue_for_save))
        };
        self.inner.checkpoint_saved.notify_waiters();
        if overdue {
            self.save_last_sequence();
        }
        saved
    }
}

/// Outcome of claiming the right to save the checkpoint.
enum SaveStep {
    /// Nothing changed since the last save.
    Idle,
    /// Another save is in flight.
    Busy,
    Ready(PendingSave),
}

struct PendingSave {
    checkpoint_id: String,
    checkpoint: Checkpoint,
    sequence: String,
}

impl fmt::Display for ReplicationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.is_push() { "Push" } else { "Pull" };
        write!(f, "{name}[{}]", self.remote().masked_url())
    }
}

impl fmt::Debug for ReplicationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationSession")
            .field("remote", &self.remote().masked_url())
            .field("push", &self.is_push())
            .field("status", &self.status())
            .finish()
    }
}

/// Runs `f` inside one store transaction, rolling back if it fails.
pub fn with_transaction<F>(store: &dyn LocalStore, f: F) -> StoreResult<()>
where
    F: FnOnce(&dyn LocalStore) -> StoreResult<()>,
{
    store.begin_transaction()?;
    let result = f(store);
    store.end_transaction(result.is_ok())?;
    result
}
