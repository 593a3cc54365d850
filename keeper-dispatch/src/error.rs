//! Error kinds produced along the dispatch and forwarding paths.
//!
//! Every error funnels, eventually, through `RequestProcessor::on_error` so that a given
//! `(session_id, xid)` receives exactly one terminal response. See `processor` for that contract.

use keeper_raft::NodeId;

/// A Raft-facing status code carried by a `ForwardResponse` or synthesized locally.
///
/// Named the way the source's `accepted=false` responses carry a "raft code": these are the
/// terminal codes that can reach a user callback as an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RaftCode {
    Ok,
    Failed,
    Cancelled,
    Timeout,
}

/// Error kinds surfaced by the dispatch/forwarding pipeline.
///
/// Every variant here is terminal: once produced, it is handed to
/// `RequestProcessor::on_error` and converted into exactly one response event for the
/// originating `(session_id, xid)`.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The lane's `RequestsQueue` (or `ForwardRequestQueue`) was at capacity.
    #[error("queue is full")]
    QueueFull,

    /// The forwarder observed that this node became leader after a request was already
    /// en route to being forwarded; the caller must resubmit the request to go through the
    /// local accumulator instead.
    #[error("this node became leader mid-forward, resubmit locally")]
    NotLeader,

    /// The forwarder observed the leader change mid-flight.
    #[error("leader switched from {0:?} to {1:?}")]
    LeaderSwitched(Option<NodeId>, Option<NodeId>),

    /// No leader is currently known to the cluster.
    #[error("no leader is currently known")]
    NoLeader,

    /// No forward connection exists for the target peer/lane.
    #[error("no forward connection for peer {peer} lane {lane}")]
    NoConnection { peer: NodeId, lane: usize },

    /// An in-flight forward exceeded `operation_timeout_ms` without a matching response.
    #[error("forward request timed out")]
    Timeout,

    /// The peer (leader) rejected the forwarded request with the given Raft code.
    #[error("forward request rejected by peer: {0:?}")]
    RaftRejected(RaftCode),

    /// The request was drained during shutdown without ever completing.
    #[error("dispatcher is shutting down")]
    Shutdown,
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
