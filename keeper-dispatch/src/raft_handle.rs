//! The abstraction boundary between this pipeline and the Raft algorithm itself.
//!
//! The Raft algorithm is explicitly a collaborator, not something this crate reimplements: it
//! must provide `is_leader`, `leader_id`, `my_id`, a way to append entries, a commit observation
//! path, and a session-manager view embedded in its state machine. `KeeperRaftHandle` adapts the
//! concrete `keeper-raft`/`keeper-memstore` pair to that contract; anything implementing
//! `RaftHandle` can drive the dispatch pipeline, including a test fake.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::FuturesOrdered;
use futures::StreamExt;
use keeper_memstore::ClientRequest;
use keeper_memstore::ClientResponse;
use keeper_memstore::MemStore;
use keeper_raft::ClientWriteRequest;
use keeper_raft::NodeId;
use keeper_raft::Raft;
use keeper_raft::RaftNetwork;
use keeper_raft::State;
use tokio::sync::watch;

use crate::config::ClusterConfig;
use crate::config::PeerEndpoint;
use crate::error::DispatchError;
use crate::error::RaftCode;
use crate::forward::RequestForSession;

/// Everything the dispatch/forwarding pipeline needs from the Raft collaborator and its embedded
/// state machine.
#[async_trait]
pub trait RaftHandle: Send + Sync + 'static {
    fn my_id(&self) -> NodeId;
    async fn is_leader(&self) -> bool;
    async fn is_leader_alive(&self) -> bool;
    async fn leader_id(&self) -> Option<NodeId>;
    async fn cluster_node_count(&self) -> usize;

    /// Submit a batch of locally-accumulated requests for Raft admission, returning one outcome
    /// per input entry, in order. Each outcome is `Ok` once its entry has been committed and
    /// applied to the state machine, or `Err` if admission or commit failed.
    async fn append_entry(&self, batch: Vec<RequestForSession>) -> Vec<(i64, i64, Result<ClientResponse, DispatchError>)>;

    /// A stream of cluster topology snapshots; a new value is published on every config-reload
    /// event. `RequestForwarder::init_connections` subscribes to this to maintain its pool.
    fn subscribe_cluster_config(&self) -> watch::Receiver<ClusterConfig>;

    async fn session_to_expiration_time(&self) -> HashMap<i64, i64>;
    async fn handle_remote_session(&self, sessions: HashMap<i64, i64>);
    async fn get_dead_sessions(&self, now: i64) -> Vec<i64>;
}

/// Adapts a concrete `keeper_raft::Raft` + `keeper_memstore::MemStore` pair to `RaftHandle`.
pub struct KeeperRaftHandle<N: RaftNetwork<ClientRequest>> {
    raft: Raft<ClientRequest, ClientResponse, N, MemStore>,
    store: Arc<MemStore>,
    cluster_config_rx: watch::Receiver<ClusterConfig>,
}

impl<N: RaftNetwork<ClientRequest>> KeeperRaftHandle<N> {
    pub fn new(
        raft: Raft<ClientRequest, ClientResponse, N, MemStore>,
        store: Arc<MemStore>,
        cluster_config_rx: watch::Receiver<ClusterConfig>,
    ) -> Self {
        Self { raft, store, cluster_config_rx }
    }

    /// Derive a `ClusterConfig` from the node's current Raft membership, excluding `self` and
    /// any node not present in `known_endpoints` (membership only carries node ids, not
    /// host/port, so the forwarding address table must come from outside Raft, e.g. the
    /// `keeper.cluster.server[N]` config section).
    pub fn cluster_config_from_membership(my_id: NodeId, known_endpoints: &HashMap<NodeId, PeerEndpoint>) -> ClusterConfig {
        let peers = known_endpoints.iter().filter(|(id, ep)| **id != my_id && !ep.learner).map(|(id, ep)| (*id, ep.clone())).collect();
        ClusterConfig { peers }
    }
}

#[async_trait]
impl<N: RaftNetwork<ClientRequest>> RaftHandle for KeeperRaftHandle<N> {
    fn my_id(&self) -> NodeId {
        self.raft.metrics().borrow().id
    }

    async fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().state == State::Leader
    }

    async fn is_leader_alive(&self) -> bool {
        self.raft.metrics().borrow().current_leader.is_some()
    }

    async fn leader_id(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    async fn cluster_node_count(&self) -> usize {
        self.raft.metrics().borrow().membership_config.all_nodes().count()
    }

    async fn append_entry(&self, batch: Vec<RequestForSession>) -> Vec<(i64, i64, Result<ClientResponse, DispatchError>)> {
        let mut pending = FuturesOrdered::new();
        for entry in batch {
            let RequestForSession { session_id, xid, request, .. } = entry;
            let raft = &self.raft;
            pending.push(async move {
                let res = raft.client_write(ClientWriteRequest::new(request)).await;
                (session_id, xid, res.map(|r| r.data).map_err(map_write_err))
            });
        }
        pending.collect().await
    }

    fn subscribe_cluster_config(&self) -> watch::Receiver<ClusterConfig> {
        self.cluster_config_rx.clone()
    }

    async fn session_to_expiration_time(&self) -> HashMap<i64, i64> {
        self.store.session_to_expiration_time().await
    }

    async fn handle_remote_session(&self, sessions: HashMap<i64, i64>) {
        for (sid, exp) in sessions {
            self.store.handle_remote_session(sid, exp).await;
        }
    }

    async fn get_dead_sessions(&self, now: i64) -> Vec<i64> {
        self.store.get_dead_sessions(now).await
    }
}

fn map_write_err(err: keeper_raft::error::ClientWriteError<ClientRequest>) -> DispatchError {
    match err {
        keeper_raft::error::ClientWriteError::ForwardToLeader(_, leader) => DispatchError::LeaderSwitched(leader, leader),
        keeper_raft::error::ClientWriteError::RaftError(_) => DispatchError::RaftRejected(RaftCode::Failed),
    }
}
