//! Runtime metrics for a Raft node, exposed as a `tokio::sync::watch` stream.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::State;
use crate::raft::MembershipConfig;
use crate::LogId;
use crate::NodeId;

/// A snapshot of a Raft node's internal state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: State,
    pub current_term: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    pub membership_config: MembershipConfig,
    pub snapshot: Option<LogId>,
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::NonVoter,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: MembershipConfig::new_initial(id),
            snapshot: None,
            leader_metrics: None,
        }
    }
}

/// Metrics about a leader's view of replication progress to each other node in the cluster.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct LeaderMetrics {
    pub replication: HashMap<NodeId, ReplicationMetrics>,
}

/// Replication metrics for a single target node, from the leader's perspective.
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub matched: LogId,
}

/// A handle for waiting on a condition to materialize in a stream of `RaftMetrics`.
///
/// Typically constructed via `Raft::wait`.
#[derive(Clone)]
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

type WaitResult<T> = Result<T, WaitError>;

/// An error returned from a `Wait` operation.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for condition to hold")]
    Timeout(Duration),

    #[error("metrics stream closed while waiting for condition")]
    Closed,
}

impl Wait {
    /// Wait for `current_leader` to match the given node id.
    pub async fn current_leader(&self, leader_id: NodeId) -> WaitResult<RaftMetrics> {
        self.condition(|m| m.current_leader == Some(leader_id)).await
    }

    /// Wait for the node's state to match the given value.
    pub async fn state(&self, state: State) -> WaitResult<RaftMetrics> {
        self.condition(|m| m.state == state).await
    }

    /// Wait for `last_log_index` to reach at least the given value.
    pub async fn log(&self, index: u64) -> WaitResult<RaftMetrics> {
        self.condition(|m| m.last_log_index >= index).await
    }

    /// Wait for the node's membership to match the given set of node ids.
    pub async fn members(&self, members: std::collections::HashSet<NodeId>) -> WaitResult<RaftMetrics> {
        self.condition(|m| m.membership_config.members == members).await
    }

    async fn condition<F>(&self, mut matches: F) -> WaitResult<RaftMetrics>
    where F: FnMut(&RaftMetrics) -> bool {
        let mut rx = self.rx.clone();
        let fut = async {
            loop {
                {
                    let m = rx.borrow();
                    if matches(&m) {
                        return Ok((*m).clone());
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(WaitError::Closed);
                }
            }
        };
        match timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(WaitError::Timeout(self.timeout)),
        }
    }
}
