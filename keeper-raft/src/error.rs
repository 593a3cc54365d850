//! Error types returned by the Raft core and its public API.

use std::fmt::Debug;

use tokio::sync::oneshot::error::RecvError;

use crate::raft::MembershipConfig;
use crate::AppData;
use crate::NodeId;
use crate::SnapshotSegmentId;

/// The result of a Raft operation that hit the channel to `RaftCore`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the `Raft`'s internal task and the core loop.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("the RaftCore task has shut down")]
    ShuttingDown,

    #[error("raft storage error: {0}")]
    RaftStorage(anyhow::Error),

    #[error("raft network error: {0}")]
    RaftNetwork(anyhow::Error),

    #[error("snapshot segment mismatch, expected {expect} got {got}")]
    SnapshotMismatch { expect: SnapshotSegmentId, got: SnapshotSegmentId },
}

impl<T> From<RecvError> for RaftError
where T: AppData
{
    fn from(_: RecvError) -> Self {
        RaftError::ShuttingDown
    }
}

/// Error variants related to a client read request.
#[derive(Debug, thiserror::Error)]
pub enum ClientReadError {
    #[error("{0}")]
    RaftError(#[from] RaftError),

    #[error("not leader, current leader: {0:?}")]
    ForwardToLeader(Option<NodeId>),
}

/// Error variants related to a client write request.
///
/// On `ForwardToLeader` the original request is handed back so the caller can resubmit it to the
/// current leader without having to reconstruct it.
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError<D: AppData> {
    #[error("{0}")]
    RaftError(#[from] RaftError),

    #[error("not leader, current leader: {1:?}")]
    ForwardToLeader(D, Option<NodeId>),
}

/// Error variants related to the initialization of a pristine Raft node.
#[derive(Debug, thiserror::Error)]
pub enum InitializeError {
    #[error("{0}")]
    RaftError(#[from] RaftError),

    #[error("this node has already been initialized with a membership config")]
    NotAllowed,

    #[error("the given config is invalid for initialization: {0:?}")]
    NotInMembers(MembershipConfig),
}

/// Error variants related to dynamic cluster membership changes.
#[derive(Debug, thiserror::Error)]
pub enum ChangeConfigError {
    #[error("{0}")]
    RaftError(#[from] RaftError),

    #[error("the cluster is already undergoing a configuration change")]
    ConfigChangeInProgress,

    #[error("the given config would leave the cluster with zero voting members")]
    InoperableConfig,

    #[error("this node is not the Raft leader, current leader: {0:?}")]
    NodeNotLeader(Option<NodeId>),

    #[error("no change to be made: proposed config is the same as the current membership")]
    Noop,
}

/// An internal error used to signal that the response channel for a request was dropped, usually
/// because the core has shut down or the caller stopped waiting.
#[derive(Debug, thiserror::Error)]
#[error("response channel for this request was unexpectedly closed")]
pub struct ResponseError;
