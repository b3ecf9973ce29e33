//! # RevSync Protocol
//!
//! Revision model and wire protocol types for RevSync replication.
//!
//! This crate provides:
//! - [`Revision`] and [`RevisionList`] for identifying document versions
//! - [`RevisionHistory`] for the `_revisions` ancestry object
//! - Checkpoint document ids ([`checkpoint_doc_id`])
//! - Request/response bodies for `_revs_diff`, `_bulk_docs` and `_changes`
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod error;
mod messages;
mod revision;
mod revision_list;

pub use checkpoint::{checkpoint_doc_id, Checkpoint, LAST_SEQUENCE_KEY};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    BulkDocsRequest, ChangeEntry, ChangeRev, ChangesResponse, FeedMode, RevsDiffEntry,
    RevsDiffRequest, RevsDiffResponse, SaveResponse,
};
pub use revision::{generation_from_rev_id, Properties, Revision, RevisionHistory};
pub use revision_list::RevisionList;
