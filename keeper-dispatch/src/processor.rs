//! Converts committed Raft log entries, and every failure path in the pipeline, into response
//! events delivered to the `Dispatcher`'s response worker pool.

use keeper_memstore::ClientResponse;
use tokio::sync::mpsc;

use crate::error::DispatchError;

/// The outcome half of a `ResponseForSession`: either the state machine's own response to a
/// committed entry, or a terminal error synthesized somewhere along the pipeline.
#[derive(Clone, Debug)]
pub enum ResponseOutcome {
    Ok,
    Data(ClientResponse),
    Error(DispatchError),
}

/// A response bound for exactly one `(session_id, xid)`.
///
/// Contract: for any admitted `(session_id, xid)`, at most one `ResponseForSession` is ever
/// produced. This is a discipline enforced by callers (the commit path emits success exactly
/// once per committed entry; every error path routes through `on_error` exactly once per
/// request) rather than by bookkeeping here, since tracking every historical `(session_id, xid)`
/// forever would be an unbounded memory leak.
#[derive(Clone, Debug)]
pub struct ResponseForSession {
    pub session_id: i64,
    pub xid: i64,
    pub outcome: ResponseOutcome,
    /// `true` for a `NewSession`/`UpdateSession` response: `session_id` here actually carries the
    /// request's `internal_id`, since the session has no stable id yet to key on. The response
    /// worker uses this to route to the session registry instead of the user registry.
    pub is_session_op: bool,
}

/// Receives committed entries from the Raft state machine's apply callback and turns every
/// failure path in the pipeline into a single terminal response.
pub struct RequestProcessor {
    responses_tx: mpsc::UnboundedSender<ResponseForSession>,
}

impl RequestProcessor {
    pub fn new(responses_tx: mpsc::UnboundedSender<ResponseForSession>) -> Self {
        Self { responses_tx }
    }

    /// Emit the state machine's response to one committed entry.
    #[tracing::instrument(level = "debug", skip(self, response))]
    pub fn on_committed(&self, session_id: i64, xid: i64, response: ClientResponse) {
        self.emit(ResponseForSession { session_id, xid, outcome: ResponseOutcome::Data(response), is_session_op: false });
    }

    /// Emit the state machine's response to a committed `NewSession`/`UpdateSession` entry,
    /// keyed on `internal_id` rather than a session id.
    #[tracing::instrument(level = "debug", skip(self, response))]
    pub fn on_committed_session(&self, internal_id: i64, response: ClientResponse) {
        self.emit(ResponseForSession { session_id: internal_id, xid: 0, outcome: ResponseOutcome::Data(response), is_session_op: true });
    }

    /// Emit a terminal error response. `from_leader` distinguishes a rejection the leader itself
    /// produced (`RaftRejected`) from one synthesized locally (admission failure, forward
    /// timeout, shutdown drain, leader switch); it is carried through to logging only, since the
    /// response shape to the client is identical either way.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn on_error(&self, from_leader: bool, code: DispatchError, session_id: i64, xid: i64, op_num: &str) {
        tracing::debug!(from_leader, %code, session_id, xid, op_num, "terminal error response");
        self.emit(ResponseForSession { session_id, xid, outcome: ResponseOutcome::Error(code), is_session_op: false });
    }

    /// Emit a terminal error for a `NewSession`/`UpdateSession` request, keyed on `internal_id`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn on_error_session(&self, from_leader: bool, code: DispatchError, internal_id: i64, op_num: &str) {
        tracing::debug!(from_leader, %code, internal_id, op_num, "terminal session error response");
        self.emit(ResponseForSession { session_id: internal_id, xid: 0, outcome: ResponseOutcome::Error(code), is_session_op: true });
    }

    fn emit(&self, resp: ResponseForSession) {
        if self.responses_tx.send(resp).is_err() {
            tracing::warn!("responses queue receiver dropped; dispatcher is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_error_emits_exactly_one_response() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let processor = RequestProcessor::new(tx);
        processor.on_error(false, DispatchError::Timeout, 1, 2, "create");
        let resp = rx.try_recv().expect("one response");
        assert_eq!(resp.session_id, 1);
        assert_eq!(resp.xid, 2);
        assert!(matches!(resp.outcome, ResponseOutcome::Error(DispatchError::Timeout)));
        assert!(rx.try_recv().is_err());
    }
}
