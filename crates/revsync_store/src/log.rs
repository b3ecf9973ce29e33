//! Replication log for one (remote, direction) pair.

use revsync_protocol::{Revision, RevisionList};

/// An entry in the replication log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// The revision awaiting replication.
    pub revision: Revision,
    /// When a session last tried to replicate it (ms since epoch).
    pub attempted_at: Option<i64>,
}

impl LogEntry {
    /// Creates a new, not yet attempted entry.
    pub fn new(revision: Revision) -> Self {
        Self {
            revision,
            attempted_at: None,
        }
    }

    /// Returns true if no session has tried this entry yet.
    pub fn is_pending(&self) -> bool {
        self.attempted_at.is_none()
    }
}

/// Revisions waiting to be confirmed by one remote in one direction.
///
/// # Invariants
///
/// - A revision appears at most once
/// - Entries leave the log only when the remote confirmed them
/// - Pending entries are returned in sequence order
#[derive(Debug, Clone, Default)]
pub struct ReplicationLog {
    entries: Vec<LogEntry>,
}

impl ReplicationLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a revision. Logging a revision twice keeps the first entry.
    pub fn log(&mut self, revision: Revision) {
        if !self.entries.iter().any(|e| e.revision == revision) {
            self.entries.push(LogEntry::new(revision));
        }
    }

    /// Marks a revision as attempted. Returns false if it is not logged.
    pub fn mark_attempted(&mut self, revision: &Revision, at: i64) -> bool {
        match self.entries.iter_mut().find(|e| &e.revision == revision) {
            Some(entry) => {
                entry.attempted_at = Some(at);
                true
            }
            None => false,
        }
    }

    /// Removes a revision. Returns false if it was not logged.
    pub fn remove(&mut self, revision: &Revision) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.revision != revision);
        self.entries.len() != before
    }

    /// Clears every attempt mark.
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.attempted_at = None;
        }
    }

    /// Returns the entries not yet attempted, oldest sequence first.
    pub fn pending(&self) -> RevisionList {
        let mut pending: RevisionList = self
            .entries
            .iter()
            .filter(|e| e.is_pending())
            .map(|e| e.revision.clone())
            .collect();
        pending.sort_by_sequence();
        pending
    }

    /// Returns the entry for a revision.
    pub fn get(&self, revision: &Revision) -> Option<&LogEntry> {
        self.entries.iter().find(|e| &e.revision == revision)
    }

    /// Returns the total number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
