//! `RequestAccumulator`: the leader-side counterpart to `RequestForwarder`. Coalesces a lane's
//! admitted requests into batches and submits each batch for Raft admission in one shot.
//!
//! async-raft's public `client_write` only accepts one entry at a time, so "one Raft
//! `append_entries` call per batch" is approximated here by submitting every entry in the batch
//! concurrently and collecting the results in submission order (`RaftHandle::append_entry`, via
//! `futures::stream::FuturesOrdered`) rather than literally building one multi-entry log append.
//! Per-lane FIFO is preserved because the results come back in the same order they were
//! submitted, and because a lane has exactly one accumulator task draining it.

use std::sync::Arc;

use keeper_memstore::KeeperOp;

use crate::error::DispatchError;
use crate::forward::RequestForSession;
use crate::processor::RequestProcessor;
use crate::raft_handle::RaftHandle;

/// Whether `op` is a session-management entry, whose response is keyed by `internal_id` (carried
/// as this request's `xid`) rather than by `session_id`.
fn is_session_op(op: &KeeperOp) -> bool {
    matches!(op, KeeperOp::NewSession { .. } | KeeperOp::UpdateSession { .. })
}

pub struct RequestAccumulator {
    lane: usize,
    raft: Arc<dyn RaftHandle>,
    processor: Arc<RequestProcessor>,
}

impl RequestAccumulator {
    pub fn new(lane: usize, raft: Arc<dyn RaftHandle>, processor: Arc<RequestProcessor>) -> Self {
        Self { lane, raft, processor }
    }

    /// Submit a batch for Raft admission and route each outcome back to the `RequestProcessor`.
    pub async fn submit_batch(&self, batch: Vec<RequestForSession>) {
        let count = batch.len();
        let session_flags: Vec<bool> = batch.iter().map(|req| is_session_op(&req.request.op)).collect();
        let outcomes = self.raft.append_entry(batch).await;
        tracing::debug!(lane = self.lane, batch_size = count, "submitted batch for admission");
        for ((session_id, xid, result), is_session) in outcomes.into_iter().zip(session_flags) {
            match (result, is_session) {
                (Ok(response), true) => self.processor.on_committed_session(xid, response),
                (Ok(response), false) => self.processor.on_committed(session_id, xid, response),
                (Err(err), true) => self.processor.on_error_session(true, err, xid, "accumulator"),
                (Err(err), false) => self.processor.on_error(true, err, session_id, xid, "accumulator"),
            }
        }
    }

    /// Fail every entry in `batch` with `err` without submitting it, used to drain a lane during
    /// shutdown.
    pub fn fail_batch(&self, batch: Vec<RequestForSession>, err: DispatchError) {
        for req in batch {
            if is_session_op(&req.request.op) {
                self.processor.on_error_session(false, err.clone(), req.xid, "accumulator-drain");
            } else {
                self.processor.on_error(false, err.clone(), req.session_id, req.xid, "accumulator-drain");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keeper_memstore::ClientResponse;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct CountingHandle;

    #[async_trait]
    impl RaftHandle for CountingHandle {
        fn my_id(&self) -> keeper_raft::NodeId {
            1
        }
        async fn is_leader(&self) -> bool {
            true
        }
        async fn is_leader_alive(&self) -> bool {
            true
        }
        async fn leader_id(&self) -> Option<keeper_raft::NodeId> {
            Some(1)
        }
        async fn cluster_node_count(&self) -> usize {
            1
        }
        async fn append_entry(&self, batch: Vec<RequestForSession>) -> Vec<(i64, i64, Result<ClientResponse, DispatchError>)> {
            batch.into_iter().map(|r| (r.session_id, r.xid, Ok(ClientResponse::Ok))).collect()
        }
        fn subscribe_cluster_config(&self) -> tokio::sync::watch::Receiver<crate::config::ClusterConfig> {
            tokio::sync::watch::channel(crate::config::ClusterConfig::default()).1
        }
        async fn session_to_expiration_time(&self) -> HashMap<i64, i64> {
            HashMap::new()
        }
        async fn handle_remote_session(&self, _sessions: HashMap<i64, i64>) {}
        async fn get_dead_sessions(&self, _now: i64) -> Vec<i64> {
            Vec::new()
        }
    }

    fn req(session_id: i64, xid: i64) -> RequestForSession {
        RequestForSession {
            session_id,
            xid,
            request: keeper_memstore::ClientRequest { session_id, xid, op: keeper_memstore::KeeperOp::Delete { path: "/x".into() } },
            received_at: 0,
        }
    }

    fn session_req(internal_id: i64) -> RequestForSession {
        RequestForSession {
            session_id: 0,
            xid: internal_id,
            request: keeper_memstore::ClientRequest {
                session_id: 0,
                xid: internal_id,
                op: keeper_memstore::KeeperOp::NewSession { session_id: 0, timeout_ms: 10_000 },
            },
            received_at: 0,
        }
    }

    #[tokio::test]
    async fn batch_submission_emits_one_response_per_entry() {
        let (responses_tx, mut responses_rx) = mpsc::unbounded_channel();
        let processor = Arc::new(RequestProcessor::new(responses_tx));
        let raft: Arc<dyn RaftHandle> = Arc::new(CountingHandle);
        let accumulator = RequestAccumulator::new(0, raft, processor);

        accumulator.submit_batch(vec![req(1, 1), req(1, 2)]).await;

        let first = responses_rx.recv().await.unwrap();
        let second = responses_rx.recv().await.unwrap();
        assert_eq!((first.session_id, first.xid), (1, 1));
        assert_eq!((second.session_id, second.xid), (1, 2));
        assert!(!first.is_session_op);
    }

    #[tokio::test]
    async fn session_op_response_is_keyed_by_internal_id() {
        let (responses_tx, mut responses_rx) = mpsc::unbounded_channel();
        let processor = Arc::new(RequestProcessor::new(responses_tx));
        let raft: Arc<dyn RaftHandle> = Arc::new(CountingHandle);
        let accumulator = RequestAccumulator::new(0, raft, processor);

        accumulator.submit_batch(vec![session_req(42)]).await;

        let resp = responses_rx.recv().await.unwrap();
        assert!(resp.is_session_op);
        assert_eq!(resp.session_id, 42);
    }

    #[tokio::test]
    async fn fail_batch_routes_session_ops_by_internal_id() {
        let (responses_tx, mut responses_rx) = mpsc::unbounded_channel();
        let processor = Arc::new(RequestProcessor::new(responses_tx));
        let raft: Arc<dyn RaftHandle> = Arc::new(CountingHandle);
        let accumulator = RequestAccumulator::new(0, raft, processor);

        accumulator.fail_batch(vec![session_req(7)], DispatchError::Shutdown);

        let resp = responses_rx.recv().await.unwrap();
        assert!(resp.is_session_op);
        assert_eq!(resp.session_id, 7);
    }
}
