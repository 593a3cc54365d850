//! `RequestForwarder`: ships a follower lane's locally-admitted requests to the current leader
//! and turns the leader's replies back into terminal responses.
//!
//! `forward_user` is called directly from the dispatcher's per-lane worker as each request is
//! pulled off the queue (no dedicated send task: that worker already owns the lane's
//! `LaneReceiver` and branches leader/follower per batch, so a separate send loop would just be a
//! second consumer racing it for the same receiver). The receive loop is this type's own task: it
//! reads `ForwardResponse` frames, does `find_and_remove`, and hands the outcome to the
//! `RequestProcessor`. Both paths share only the lane's `ForwardConnectionPool` and
//! `ForwardRequestQueue`, which are internally synchronized; nothing else crosses between them.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tokio::sync::watch;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::connection::ForwardConnectionPool;
use crate::error::DispatchError;
use crate::forward::ForwardBody;
use crate::forward::ForwardRequest;
use crate::forward::ForwardResponse;
use crate::forward_queue::ForwardRequestQueue;
use crate::processor::RequestProcessor;
use crate::raft_handle::RaftHandle;
use crate::stats::ConnectionStats;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as i64
}

/// One lane's forwarding state: the in-flight window and a monotonic token source for
/// session-management/sync correlation ids.
pub struct RequestForwarder {
    lane: usize,
    my_id: keeper_raft::NodeId,
    config: Arc<Config>,
    raft: Arc<dyn RaftHandle>,
    pool: Arc<ForwardConnectionPool>,
    in_flight: ForwardRequestQueue,
    processor: Arc<RequestProcessor>,
    current_leader: Mutex<Option<keeper_raft::NodeId>>,
    sync_token: AtomicU64,
    stats: Arc<ConnectionStats>,
}

impl RequestForwarder {
    pub fn new(
        lane: usize,
        my_id: keeper_raft::NodeId,
        config: Arc<Config>,
        raft: Arc<dyn RaftHandle>,
        pool: Arc<ForwardConnectionPool>,
        processor: Arc<RequestProcessor>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        let in_flight = ForwardRequestQueue::new(config.forward_queue_capacity);
        Self { lane, my_id, config, raft, pool, in_flight, processor, current_leader: Mutex::new(None), sync_token: AtomicU64::new(0), stats }
    }

    /// Drain `in_flight` and fail every entry with `code`. Used both when the leader changes
    /// mid-flight and during shutdown.
    async fn fail_in_flight(&self, code: DispatchError) {
        for req in self.in_flight.drain().await {
            self.emit_failure(&req, code.clone());
        }
    }

    fn emit_failure(&self, req: &ForwardRequest, code: DispatchError) {
        match &req.body {
            ForwardBody::UserOp(inner) => self.processor.on_error(false, code, inner.session_id, inner.xid, "forward"),
            ForwardBody::NewSession { internal_id, .. } | ForwardBody::UpdateSession { internal_id, .. } => {
                self.processor.on_error_session(false, code, *internal_id, "session-forward");
            }
            ForwardBody::SyncSessions { .. } => {
                tracing::debug!(lane = self.lane, ?code, "sync forward dropped");
            }
        }
    }

    /// Check whether the leader has changed since the last send; if so, fail everything
    /// currently in flight (it was addressed to a peer no longer relevant) and return the new
    /// leader, reconnecting lazily on the next send.
    async fn refresh_leader(&self) -> Option<keeper_raft::NodeId> {
        let observed = self.raft.leader_id().await;
        let mut guard = self.current_leader.lock().await;
        if *guard != observed {
            if guard.is_some() {
                let old = *guard;
                let new = observed;
                drop(guard);
                self.fail_in_flight(DispatchError::LeaderSwitched(old, new)).await;
                guard = self.current_leader.lock().await;
            }
            *guard = observed;
        }
        observed
    }

    /// Periodically forward a `SyncSessions` frame carrying every session local to this node
    /// that the leader does not already know about.
    pub async fn run_session_sync_loop(self: Arc<Self>, callbacks: Arc<crate::callbacks::CallbackRegistries>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.session_sync_period());
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => { if *shutdown.borrow() { return } }
                _ = ticker.tick() => {
                    let mut sessions = self.raft.session_to_expiration_time().await;
                    callbacks.filter_local_sessions(&mut sessions).await;
                    if sessions.is_empty() {
                        continue;
                    }
                    let token = self.sync_token.fetch_add(1, Ordering::Relaxed);
                    let _ = self.forward(ForwardBody::SyncSessions { token, sessions }).await;
                }
            }
        }
    }

    /// Forward a single user request to the current leader. Used by the dispatcher's per-lane
    /// worker when this node is not the leader; unlike the accumulator's batched admission path,
    /// each request is sent as soon as it is pulled off the queue.
    pub async fn forward_user(&self, req: crate::forward::RequestForSession) -> Result<(), DispatchError> {
        self.forward(ForwardBody::UserOp(req)).await
    }

    async fn forward(&self, body: ForwardBody) -> Result<(), DispatchError> {
        let leader = self.refresh_leader().await.ok_or(DispatchError::NoLeader)?;
        if leader == self.my_id {
            return Err(DispatchError::NotLeader);
        }
        let conn = match self.pool.get(leader, self.lane).await {
            Some(conn) => conn,
            None => return Err(DispatchError::NoConnection { peer: leader, lane: self.lane }),
        };
        if conn.state() != crate::connection::ConnectionState::Connected {
            conn.connect().await?;
        }

        let req = ForwardRequest { origin_server_id: self.my_id, origin_lane: self.lane, body, send_time: now_ms() };
        self.in_flight.push(req.clone()).await?;
        if let Err(err) = conn.send(&req).await {
            self.in_flight.find_and_remove(&ForwardResponse { correlation: req.correlation(), accepted: false, raft_code: crate::error::RaftCode::Failed, response: None }).await;
            self.emit_failure(&req, err.clone());
            return Err(err);
        }
        self.stats.increment_packets_sent();
        Ok(())
    }

    /// Receive loop: read replies from the current leader's connection and resolve the matching
    /// in-flight entry, or sweep entries that exceeded `operation_timeout_ms`.
    pub async fn run_receive_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                self.fail_in_flight(DispatchError::Shutdown).await;
                break;
            }
            let leader = self.current_leader.lock().await.clone();
            let conn = match leader {
                Some(peer) => self.pool.get(peer, self.lane).await,
                None => None,
            };

            let wait = Duration::from_millis(self.config.heart_beat_interval_ms);
            let resp = match &conn {
                Some(conn) => conn.recv_timeout(wait).await,
                None => {
                    tokio::time::sleep(wait).await;
                    None
                }
            };

            if let Some(resp) = resp {
                self.resolve(resp).await;
            }

            let timed_out = self.in_flight.pop_timed_out(now_ms(), self.config.operation_timeout_ms as i64).await;
            for req in timed_out {
                self.emit_failure(&req, DispatchError::Timeout);
            }
        }
    }

    async fn resolve(&self, resp: ForwardResponse) {
        let Some(req) = self.in_flight.find_and_remove(&resp).await else {
            tracing::debug!(lane = self.lane, correlation = ?resp.correlation, "stale forward response discarded");
            return;
        };
        self.stats.increment_packets_received();
        self.stats.record_latency_ms((now_ms() - req.send_time).max(0) as u64);
        match req.body {
            ForwardBody::UserOp(inner) => {
                if resp.accepted {
                    match resp.response {
                        Some(data) => self.processor.on_committed(inner.session_id, inner.xid, data),
                        None => self.processor.on_error(true, DispatchError::RaftRejected(resp.raft_code), inner.session_id, inner.xid, "forward"),
                    }
                } else {
                    self.processor.on_error(true, DispatchError::RaftRejected(resp.raft_code), inner.session_id, inner.xid, "forward");
                }
            }
            ForwardBody::NewSession { internal_id, .. } | ForwardBody::UpdateSession { internal_id, .. } => {
                if resp.accepted {
                    self.processor.on_committed_session(internal_id, keeper_memstore::ClientResponse::Ok);
                } else {
                    self.processor.on_error_session(true, DispatchError::RaftRejected(resp.raft_code), internal_id, "session-forward");
                }
            }
            ForwardBody::SyncSessions { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RaftCode;
    use crate::forward::Correlation;
    use keeper_memstore::ClientResponse;

    #[tokio::test]
    async fn resolve_emits_committed_response_on_accept() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let processor = Arc::new(RequestProcessor::new(tx));
        let pool = Arc::new(ForwardConnectionPool::new(1));
        let config = Arc::new(Config::build(1).validate().unwrap());
        let raft = Arc::new(crate::raft_handle::tests::NoopHandle::new(1));
        let stats = Arc::new(ConnectionStats::new());
        let forwarder = RequestForwarder::new(0, 1, config, raft, pool, processor, stats);

        let body = ForwardBody::UserOp(crate::forward::RequestForSession {
            session_id: 9,
            xid: 1,
            request: keeper_memstore::ClientRequest { session_id: 9, xid: 1, op: keeper_memstore::KeeperOp::Delete { path: "/x".into() } },
            received_at: 0,
        });
        let req = ForwardRequest { origin_server_id: 1, origin_lane: 0, body, send_time: now_ms() };
        forwarder.in_flight.push(req.clone()).await.unwrap();

        forwarder
            .resolve(ForwardResponse {
                correlation: Correlation::UserOp { session_id: 9, xid: 1 },
                accepted: true,
                raft_code: RaftCode::Ok,
                response: Some(ClientResponse::Ok),
            })
            .await;

        let resp = rx.try_recv().expect("one response");
        assert_eq!(resp.session_id, 9);
        assert!(matches!(resp.outcome, crate::processor::ResponseOutcome::Data(ClientResponse::Ok)));
    }
}
