//! CLI command implementations.

pub mod changes;
pub mod checkpoint_id;
pub mod push;
