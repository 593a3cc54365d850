//! Per-peer, per-lane forward connections and the pool that maintains them across config
//! reloads.

use std::collections::HashMap;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use keeper_raft::NodeId;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;

use crate::config::ClusterConfig;
use crate::config::PeerEndpoint;
use crate::error::DispatchError;
use crate::forward::ForwardRequest;
use crate::forward::ForwardResponse;

/// `DISCONNECTED → CONNECTING → CONNECTED → DISCONNECTED`, transitioned by send/receive I/O
/// errors and reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// One lane's persistent connection to one peer. Owned exclusively by that lane: the send task
/// writes to it, the receive task reads from it, and neither needs external synchronization
/// beyond the stream's own internal buffering.
pub struct ForwardConnection {
    pub peer_id: NodeId,
    pub lane: usize,
    addr: String,
    state: AtomicU8,
    stream: Mutex<Option<Framed<TcpStream, LengthDelimitedCodec>>>,
}

impl ForwardConnection {
    pub fn new(peer_id: NodeId, lane: usize, addr: String) -> Self {
        Self { peer_id, lane, addr, state: AtomicU8::new(ConnectionState::Disconnected as u8), stream: Mutex::new(None) }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ConnectionState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub async fn connect(&self) -> Result<(), DispatchError> {
        self.set_state(ConnectionState::Connecting);
        match TcpStream::connect(self.addr.as_str()).await {
            Ok(tcp) => {
                *self.stream.lock().await = Some(Framed::new(tcp, LengthDelimitedCodec::new()));
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                tracing::debug!(peer = self.peer_id, lane = self.lane, %err, "forward connection failed");
                self.set_state(ConnectionState::Disconnected);
                Err(DispatchError::NoConnection { peer: self.peer_id, lane: self.lane })
            }
        }
    }

    pub async fn send(&self, req: &ForwardRequest) -> Result<(), DispatchError> {
        use futures::SinkExt;
        let payload = serde_json::to_vec(req).expect("ForwardRequest is always serializable");
        let mut guard = self.stream.lock().await;
        match guard.as_mut() {
            Some(framed) => match framed.send(Bytes::from(payload)).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    tracing::debug!(peer = self.peer_id, lane = self.lane, %err, "forward send failed");
                    *guard = None;
                    self.set_state(ConnectionState::Disconnected);
                    Err(DispatchError::NoConnection { peer: self.peer_id, lane: self.lane })
                }
            },
            None => Err(DispatchError::NoConnection { peer: self.peer_id, lane: self.lane }),
        }
    }

    /// Wait up to `timeout` for the next response frame. Folds the source's separate
    /// `poll(timeout)` + `receive()` steps into one call, since `tokio_util::Framed` has no
    /// peek-without-consume primitive; functionally equivalent for the receive loop's purposes.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<ForwardResponse> {
        use futures::StreamExt;
        let mut guard = self.stream.lock().await;
        let framed = guard.as_mut()?;
        match tokio::time::timeout(timeout, framed.next()).await {
            Ok(Some(Ok(buf))) => serde_json::from_slice::<ForwardResponse>(&buf).ok(),
            Ok(Some(Err(err))) => {
                tracing::debug!(peer = self.peer_id, lane = self.lane, %err, "forward receive failed");
                *guard = None;
                self.set_state(ConnectionState::Disconnected);
                None
            }
            Ok(None) => {
                *guard = None;
                self.set_state(ConnectionState::Disconnected);
                None
            }
            Err(_elapsed) => None,
        }
    }
}

/// Owns every `connections[peer_id][lane]` pool and reconciles it against a new `ClusterConfig`
/// on every config-reload event.
pub struct ForwardConnectionPool {
    parallel: usize,
    connections: Mutex<HashMap<NodeId, Vec<Arc<ForwardConnection>>>>,
}

impl ForwardConnectionPool {
    pub fn new(parallel: usize) -> Self {
        Self { parallel, connections: Mutex::new(HashMap::new()) }
    }

    pub async fn get(&self, peer_id: NodeId, lane: usize) -> Option<Arc<ForwardConnection>> {
        self.connections.lock().await.get(&peer_id).and_then(|v| v.get(lane)).cloned()
    }

    /// Build a fresh pool of `parallel` connections for `peer`.
    fn new_pool(parallel: usize, peer: &PeerEndpoint) -> Vec<Arc<ForwardConnection>> {
        (0..parallel).map(|lane| Arc::new(ForwardConnection::new(peer.id, lane, peer.addr()))).collect()
    }

    /// Diff the live pool against `desired` and mutate it: add pools for new/changed peers,
    /// remove pools for peers that disappeared, leave unchanged peers untouched.
    ///
    /// Keys every lookup *before* mutating the map, unlike the source's remove-loop, which
    /// erases an entry by iterator and then dereferences that same iterator for its key — a
    /// use-after-erase. Collecting the keys to remove first, then erasing them by value, avoids
    /// it entirely.
    pub async fn reconcile(&self, desired: &ClusterConfig) -> (Vec<NodeId>, Vec<NodeId>) {
        let mut guard = self.connections.lock().await;

        let stale_peers: Vec<NodeId> = guard.keys().filter(|id| !desired.peers.contains_key(id)).copied().collect();
        for peer_id in &stale_peers {
            guard.remove(peer_id);
        }

        let mut added = Vec::new();
        for (peer_id, endpoint) in &desired.peers {
            let needs_new_pool = match guard.get(peer_id) {
                None => true,
                Some(existing) => existing.first().map(|c| c.addr != endpoint.addr()).unwrap_or(true),
            };
            if needs_new_pool {
                guard.insert(*peer_id, Self::new_pool(self.parallel, endpoint));
                added.push(*peer_id);
            }
        }

        (added, stale_peers)
    }

    pub async fn peer_ids(&self) -> Vec<NodeId> {
        self.connections.lock().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn endpoint(id: NodeId, host: &str) -> PeerEndpoint {
        PeerEndpoint { id, host: host.into(), forwarding_port: 8102, learner: false }
    }

    #[tokio::test]
    async fn reconcile_adds_removes_and_preserves_unchanged() {
        let pool = ForwardConnectionPool::new(2);
        let initial = ClusterConfig { peers: btreemap! {1=>endpoint(1,"h1"), 2=>endpoint(2,"h2")} };
        pool.reconcile(&initial).await;
        let original_identity = pool.get(1, 0).await.unwrap().addr.clone();

        let next = ClusterConfig { peers: btreemap! {1=>endpoint(1,"h1"), 3=>endpoint(3,"h3")} };
        let (added, removed) = pool.reconcile(&next).await;

        assert_eq!(added, vec![3]);
        assert_eq!(removed, vec![2]);
        assert_eq!(pool.peer_ids().await.len(), 2);
        assert_eq!(pool.get(1, 0).await.unwrap().addr, original_identity);
        assert_eq!(pool.get(3, 0).await.unwrap().lane, 0);
        assert!(pool.get(2, 0).await.is_none());
    }
}
