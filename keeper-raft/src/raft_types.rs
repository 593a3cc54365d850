//! Small shared types used across the Raft core that don't belong to any one module.

use serde::Deserialize;
use serde::Serialize;

/// The identifier of a snapshot, unique only in combination with the `last_log_id` it covers.
pub type SnapshotId = String;

/// An identifier for one segment of a snapshot stream.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct SnapshotSegmentId {
    pub id: SnapshotId,
    pub offset: u64,
}

impl std::fmt::Display for SnapshotSegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.id, self.offset)
    }
}

/// A value that may be updated out from under a task that is currently reading it.
///
/// Used to tell a long running loop that state it cached has since changed, without requiring it
/// to poll the authoritative source on every iteration.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Update<T> {
    Update(T),
    Unchanged,
}
