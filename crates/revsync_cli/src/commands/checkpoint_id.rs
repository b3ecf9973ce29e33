//! Checkpoint-id command implementation.

use revsync_protocol::checkpoint_doc_id;

/// Prints the checkpoint document id for (uuid, remote, direction).
pub fn run(uuid: &str, remote: &str, push: bool) {
    println!("_local/{}", checkpoint_doc_id(uuid, remote, push));
}
