//! The `Session` data model and the lane-hashing rule that pins a session to one lane for life.

use std::hash::Hasher;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use keeper_raft::NodeId;
use serde::Deserialize;
use serde::Serialize;

/// A live client session, as tracked on the node that terminates the client's connection.
///
/// A session is *local* on exactly one node at a time: the one whose network front-end accepted
/// the client's TCP connection. Every other node in the cluster only ever sees it via the
/// periodic session-sync protocol (`ForwardRequest::SyncSessions`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: i64,
    pub expiration_time: i64,
    pub owner_node_id: NodeId,
    pub is_local: bool,
}

/// Compute the lane a session is bound to. Stable for the lifetime of the session: callers must
/// never recompute this with a different `parallel` while the session is alive.
pub fn lane_of(session_id: i64, parallel: usize) -> usize {
    debug_assert!(parallel > 0);
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hasher.write_i64(session_id);
    (hasher.finish() % parallel as u64) as usize
}

/// Assigns `internal_id` values to new-session/update-session requests before they have a real
/// `session_id` to correlate on. Seeded at this node's own id and striped by the cluster's node
/// count so two nodes allocating concurrently never collide, mirroring the source's
/// `getAndAddInternalId += cluster_node_count`.
pub struct InternalIdAllocator {
    next: AtomicI64,
}

impl InternalIdAllocator {
    pub fn new(my_id: NodeId) -> Self {
        Self { next: AtomicI64::new(my_id as i64) }
    }

    /// Allocate the next id, advancing by `stride` (the current cluster node count) so this
    /// node's sequence never overlaps a peer's.
    pub fn allocate(&self, stride: usize) -> i64 {
        let stride = stride.max(1) as i64;
        self.next.fetch_add(stride, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_is_stable_for_same_session() {
        assert_eq!(lane_of(42, 8), lane_of(42, 8));
    }

    #[test]
    fn lane_is_in_range() {
        for sid in 0..1000i64 {
            assert!(lane_of(sid, 7) < 7);
        }
    }

    #[test]
    fn internal_ids_never_collide_across_nodes() {
        let a = InternalIdAllocator::new(1);
        let b = InternalIdAllocator::new(2);
        let from_a: Vec<i64> = (0..5).map(|_| a.allocate(3)).collect();
        let from_b: Vec<i64> = (0..5).map(|_| b.allocate(3)).collect();
        for id in &from_a {
            assert!(!from_b.contains(id));
        }
    }
}
