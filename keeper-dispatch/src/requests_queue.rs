//! Bounded multi-lane FIFO queue that routes admitted requests by `hash(session_id) % parallel`.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::DispatchError;
use crate::forward::RequestForSession;
use crate::session::lane_of;

/// The producer side, shared by every task that admits requests (the network front-end calling
/// `Dispatcher::push_request`, and the `RequestForwarder` receive loop re-queuing local retries).
#[derive(Clone)]
pub struct RequestsQueue {
    parallel: usize,
    senders: Vec<mpsc::Sender<RequestForSession>>,
}

/// The single-consumer receive half for one lane. Each lane has exactly one consumer: the
/// request worker thread bound to that lane.
pub struct LaneReceiver {
    pub lane: usize,
    rx: mpsc::Receiver<RequestForSession>,
}

impl RequestsQueue {
    pub fn new(parallel: usize, capacity: usize) -> (Self, Vec<LaneReceiver>) {
        let mut senders = Vec::with_capacity(parallel);
        let mut receivers = Vec::with_capacity(parallel);
        for lane in 0..parallel {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            receivers.push(LaneReceiver { lane, rx });
        }
        (Self { parallel, senders }, receivers)
    }

    pub fn lane_of(&self, session_id: i64) -> usize {
        lane_of(session_id, self.parallel)
    }

    /// Admit `req`, routing to its session's lane. Fails with `QueueFull` if that lane's queue is
    /// at capacity, or `Shutdown` if the lane's consumer has gone away.
    pub fn push(&self, req: RequestForSession) -> Result<(), DispatchError> {
        let lane = self.lane_of(req.session_id);
        match self.senders[lane].try_send(req) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DispatchError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Shutdown),
        }
    }

    pub fn parallel(&self) -> usize {
        self.parallel
    }
}

impl LaneReceiver {
    /// Block for up to `timeout` for the next request on this lane. Used by both the request
    /// worker and the forwarder's send loop, which shortens `timeout` to the remaining time
    /// before its next session-sync slot.
    pub async fn try_pop(&mut self, timeout: Duration) -> Option<RequestForSession> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }

    /// Pop one request if one is already queued, without blocking. Used by the accumulator to
    /// opportunistically coalesce a batch once it already has its first entry.
    pub fn try_pop_now(&mut self) -> Option<RequestForSession> {
        self.rx.try_recv().ok()
    }

    /// Drain every currently-queued request on this lane without blocking. Used only during
    /// shutdown, to synthesize `CANCELLED` responses for everything still sitting in the queue.
    pub fn drain_now(&mut self) -> Vec<RequestForSession> {
        let mut out = Vec::new();
        while let Ok(req) = self.rx.try_recv() {
            out.push(req);
        }
        out
    }
}

/// `tryPopAny`: drain every lane's queue, used only during shutdown.
pub fn drain_all(receivers: &mut [LaneReceiver]) -> Vec<RequestForSession> {
    receivers.iter_mut().flat_map(|r| r.drain_now()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_memstore::ClientRequest;
    use keeper_memstore::KeeperOp;

    fn req(session_id: i64, xid: i64) -> RequestForSession {
        RequestForSession {
            session_id,
            xid,
            request: ClientRequest { session_id, xid, op: KeeperOp::Delete { path: "/x".into() } },
            received_at: 0,
        }
    }

    #[tokio::test]
    async fn fifo_within_a_lane() {
        let (queue, mut receivers) = RequestsQueue::new(1, 8);
        queue.push(req(1, 1)).unwrap();
        queue.push(req(1, 2)).unwrap();
        let lane = &mut receivers[0];
        assert_eq!(lane.try_pop(Duration::from_millis(50)).await.unwrap().xid, 1);
        assert_eq!(lane.try_pop(Duration::from_millis(50)).await.unwrap().xid, 2);
    }

    #[tokio::test]
    async fn push_fails_when_lane_full() {
        let (queue, _receivers) = RequestsQueue::new(1, 1);
        queue.push(req(1, 1)).unwrap();
        let err = queue.push(req(1, 2)).unwrap_err();
        assert_eq!(err, DispatchError::QueueFull);
    }

    #[tokio::test]
    async fn drain_all_collects_every_lane() {
        let (queue, mut receivers) = RequestsQueue::new(2, 8);
        queue.push(req(1, 1)).unwrap();
        queue.push(req(2, 1)).unwrap();
        let drained = drain_all(&mut receivers);
        assert_eq!(drained.len(), 2);
    }
}
