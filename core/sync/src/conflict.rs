//! Last-write-wins conflict resolution.

use serde::{Deserialize, Serialize};

use mirrorsync_common::Change;

/// What to do with a candidate record on the other store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteDecision {
    /// The target has never seen this record in the window.
    Insert,
    /// The target holds an older version.
    Overwrite,
    /// The target already holds the same or a newer version.
    Skip,
}

impl WriteDecision {
    /// Whether the candidate must be written to the target.
    pub fn should_write(self) -> bool {
        !matches!(self, WriteDecision::Skip)
    }
}

/// Decide whether `candidate` replaces `existing` on the target store.
///
/// The comparison is purely on modification time. Equal timestamps keep
/// the existing version even when field contents differ.
pub fn decide(candidate: &Change, existing: Option<&Change>) -> WriteDecision {
    match existing {
        None => WriteDecision::Insert,
        Some(existing) if candidate.is_newer_than(existing) => WriteDecision::Overwrite,
        Some(_) => WriteDecision::Skip,
    }
}
