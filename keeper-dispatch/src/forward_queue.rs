//! Per-lane ordered window of outstanding forward requests.
//!
//! Single-producer (the lane's send task) / single-consumer (the lane's receive task), so a
//! plain mutex protecting ordering is sufficient — `peek`, `pop_timed_out` and `find_and_remove`
//! are atomic with respect to each other, nothing more is required.

use std::collections::VecDeque;

use tokio::sync::Mutex;

use crate::error::DispatchError;
use crate::forward::ForwardRequest;
use crate::forward::ForwardResponse;

pub struct ForwardRequestQueue {
    capacity: usize,
    inner: Mutex<VecDeque<ForwardRequest>>,
}

impl ForwardRequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, inner: Mutex::new(VecDeque::new()) }
    }

    /// Enqueue `req`. Must be called before `conn.send(req)` so the receive side can correlate a
    /// response that arrives before `send` even returns.
    pub async fn push(&self, req: ForwardRequest) -> Result<(), DispatchError> {
        let mut guard = self.inner.lock().await;
        if guard.len() >= self.capacity {
            return Err(DispatchError::QueueFull);
        }
        guard.push_back(req);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Pop every entry at the head of the queue whose deadline (`send_time + operation_timeout`)
    /// has passed as of `now`, stopping at the first entry that has not yet expired. Returns the
    /// popped entries in their original (oldest-first) order.
    pub async fn pop_timed_out(&self, now: i64, operation_timeout_ms: i64) -> Vec<ForwardRequest> {
        let mut guard = self.inner.lock().await;
        let mut timed_out = Vec::new();
        while let Some(front) = guard.front() {
            if front.send_time + operation_timeout_ms < now {
                timed_out.push(guard.pop_front().expect("front just peeked"));
            } else {
                break;
            }
        }
        timed_out
    }

    /// `findAndRemove`: scan for the first entry whose correlation key matches `resp`, and
    /// remove it regardless of queue position. Tolerates the leader replying to independent
    /// sessions out of send order; does *not* tolerate, nor need to, more than one match, since
    /// each `(session_id, xid)`/`internal_id` is only ever in flight once per lane.
    pub async fn find_and_remove(&self, resp: &ForwardResponse) -> Option<ForwardRequest> {
        let mut guard = self.inner.lock().await;
        let pos = guard.iter().position(|entry| resp.matches(entry))?;
        guard.remove(pos)
    }

    /// Drain every entry, in order, for shutdown: the forwarder synthesizes a `FAILED` response
    /// for each.
    pub async fn drain(&self) -> Vec<ForwardRequest> {
        let mut guard = self.inner.lock().await;
        guard.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::ForwardBody;
    use crate::error::RaftCode;

    fn req(token: u64, send_time: i64) -> ForwardRequest {
        ForwardRequest {
            origin_server_id: 1,
            origin_lane: 0,
            body: ForwardBody::SyncSessions { token, sessions: Default::default() },
            send_time,
        }
    }

    #[tokio::test]
    async fn pop_timed_out_stops_at_first_live_entry() {
        let q = ForwardRequestQueue::new(10);
        q.push(req(1, 0)).await.unwrap();
        q.push(req(2, 0)).await.unwrap();
        q.push(req(3, 1_000)).await.unwrap();
        let timed_out = q.pop_timed_out(600, 500).await;
        assert_eq!(timed_out.len(), 2);
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn find_and_remove_ignores_queue_position() {
        let q = ForwardRequestQueue::new(10);
        q.push(req(1, 0)).await.unwrap();
        q.push(req(2, 0)).await.unwrap();
        let resp = ForwardResponse {
            correlation: crate::forward::Correlation::Sync { token: 2 },
            accepted: true,
            raft_code: RaftCode::Ok,
            response: None,
        };
        let removed = q.find_and_remove(&resp).await.unwrap();
        assert!(matches!(removed.body, ForwardBody::SyncSessions { token: 2, .. }));
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn stale_response_is_discarded() {
        let q = ForwardRequestQueue::new(10);
        q.push(req(1, 0)).await.unwrap();
        let resp = ForwardResponse {
            correlation: crate::forward::Correlation::Sync { token: 99 },
            accepted: true,
            raft_code: RaftCode::Ok,
            response: None,
        };
        assert!(q.find_and_remove(&resp).await.is_none());
        assert_eq!(q.len().await, 1);
    }
}
