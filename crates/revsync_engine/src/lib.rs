//! # RevSync Engine
//!
//! CouchDB-style replication between a local store and a remote database.
//!
//! This crate provides:
//! - Replication sessions with checkpoint fetch and debounced save
//! - Push replication (`_revs_diff` + `_bulk_docs` with `new_edits=false`)
//! - Lean pull replication driven by the remote change feed
//! - A change-feed client supporting one-shot, long-poll and continuous modes
//! - A time/size-bounded batcher feeding revisions to sessions
//! - An HTTP client abstraction with a `reqwest` implementation
//!
//! ## Architecture
//!
//! A [`SessionFactory`] builds [`ReplicationSession`]s for a (store, remote,
//! direction) triple. The session owns the lifecycle and delegates the
//! direction-specific work to a [`ReplicationDirection`]:
//!
//! 1. Fetch the remote checkpoint and compare it with the local anchor
//! 2. Begin replicating from the agreed sequence
//! 3. Batch candidate revisions and process each batch
//! 4. Advance and save the checkpoint as batches complete
//!
//! ## Key Invariants
//!
//! - Replication-log entries are removed only after the remote confirmed them
//! - At most one checkpoint save is in flight per session
//! - Batches of one session are processed one at a time, in FIFO order
//! - A non-continuous session stops once its async tasks drain
//!
//! ## Example
//!
//! ```rust,no_run
//! use revsync_engine::{ReplicationConfig, ReqwestClient, SessionFactory};
//! use revsync_store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let factory = SessionFactory::new(store, Arc::new(ReqwestClient::new()?))?;
//! let session = factory.push(ReplicationConfig::new("http://localhost:5984/db"))?;
//! session.start();
//! session.wait_until_stopped().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batcher;
mod change_tracker;
mod config;
mod error;
mod factory;
mod http;
mod pull;
mod push;
mod session;

pub use batcher::{BatchProcessor, Batcher};
pub use change_tracker::{
    ChangeTracker, ChangeTrackerClient, TrackerState, HEARTBEAT_MS, LONGPOLL_LIMIT,
};
pub use config::{BatchConfig, ChangeTrackerConfig, ReplicationConfig, RetryConfig};
pub use error::{SyncError, SyncResult};
pub use factory::SessionFactory;
pub use http::{
    masked_url, split_credentials, HttpClient, HttpRequest, HttpResponse, ReqwestClient,
    RemoteDatabase, StreamingResponse,
};
pub use pull::{PendingSequences, PullReplication};
pub use push::PushReplication;
pub use session::{
    with_transaction, ReplicationDirection, ReplicationSession, Runtimes, SessionPhase,
    SessionStatus, WeakSession,
};
