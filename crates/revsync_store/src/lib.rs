//! # RevSync Store
//!
//! The local document store contract consumed by the replication engine.
//!
//! The replication subsystem never touches storage directly. It goes through
//! [`LocalStore`], which covers change enumeration, body loading, revision
//! ancestry, the per-remote replication log, checkpoint anchors,
//! transactions and live change notifications.
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - In-memory reference store for tests and tools
//!
//! ## Example
//!
//! ```rust
//! use revsync_store::{LocalStore, MemoryStore};
//! use serde_json::json;
//!
//! let store = MemoryStore::new();
//! let body = json!({"title": "hello"}).as_object().cloned().unwrap();
//! let rev = store.put("doc1", body).unwrap();
//! assert_eq!(rev.generation(), 1);
//! assert_eq!(store.changes_since(0, None).unwrap().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod log;
mod memory;
mod store;

pub use error::{StoreError, StoreResult};
pub use log::{LogEntry, ReplicationLog};
pub use memory::MemoryStore;
pub use store::{ChangeNotification, ContentOptions, LocalStore, RevisionFilter};
