//! Ordered lists of revisions.

use crate::messages::RevsDiffRequest;
use crate::revision::Revision;
use std::ops::{Deref, DerefMut};

/// An ordered sequence of revisions.
///
/// Order is insertion order unless re-sorted by the producer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionList {
    revisions: Vec<Revision>,
}

impl RevisionList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the revision with the given ids.
    pub fn find(&self, doc_id: &str, rev_id: &str) -> Option<&Revision> {
        self.revisions
            .iter()
            .find(|rev| rev.doc_id() == doc_id && rev.rev_id() == rev_id)
    }

    /// Returns every document id, in list order (duplicates kept).
    pub fn doc_ids(&self) -> Vec<&str> {
        self.revisions.iter().map(Revision::doc_id).collect()
    }

    /// Returns every revision id, in list order.
    pub fn rev_ids(&self) -> Vec<&str> {
        self.revisions.iter().map(Revision::rev_id).collect()
    }

    /// Sorts by local sequence, oldest first.
    pub fn sort_by_sequence(&mut self) {
        self.revisions.sort_by_key(Revision::sequence);
    }

    /// Sorts by local sequence, newest first.
    pub fn sort_by_sequence_desc(&mut self) {
        self.revisions
            .sort_by(|a, b| b.sequence().cmp(&a.sequence()));
    }

    /// Keeps at most `limit` revisions.
    pub fn truncate(&mut self, limit: usize) {
        self.revisions.truncate(limit);
    }

    /// Returns the highest local sequence in the list.
    pub fn max_sequence(&self) -> Option<u64> {
        self.revisions.iter().map(Revision::sequence).max()
    }

    /// Groups revision ids by document, in the shape `_revs_diff` expects.
    pub fn to_revs_diff(&self) -> RevsDiffRequest {
        let mut diffs = RevsDiffRequest::new();
        for rev in &self.revisions {
            diffs
                .entry(rev.doc_id().to_string())
                .or_default()
                .push(rev.rev_id().to_string());
        }
        diffs
    }

    /// Consumes the list, returning the revisions.
    pub fn into_vec(self) -> Vec<Revision> {
        self.revisions
    }
}

impl Deref for RevisionList {
    type Target = Vec<Revision>;

    fn deref(&self) -> &Self::Target {
        &self.revisions
    }
}

impl DerefMut for RevisionList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.revisions
    }
}

impl From<Vec<Revision>> for RevisionList {
    fn from(revisions: Vec<Revision>) -> Self {
        Self { revisions }
    }
}

impl FromIterator<Revision> for RevisionList {
    fn from_iter<I: IntoIterator<Item = Revision>>(iter: I) -> Self {
        Self {
            revisions: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for RevisionList {
    type Item = Revision;
    type IntoIter = std::vec::IntoIter<Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.revisions.into_iter()
    }
}

impl<'a> IntoIterator for &'a RevisionList {
    type Item = &'a Revision;
    type IntoIter = std::slice::Iter<'a, Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.revisions.iter()
    }
}
