//! The request/response data model exchanged between a follower's `RequestForwarder` and the
//! current leader, plus the abstract wire frame it rides on.

use keeper_memstore::ClientRequest;
use keeper_memstore::ClientResponse;
use keeper_raft::NodeId;
use serde::Deserialize;
use serde::Serialize;

use crate::error::RaftCode;

/// A client request as admitted into a lane's `RequestsQueue`.
///
/// Ordering invariant: requests sharing a `session_id` are processed in submission order,
/// end-to-end, because a session is pinned to a single lane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestForSession {
    pub session_id: i64,
    pub xid: i64,
    pub request: ClientRequest,
    /// Milliseconds since the epoch at admission time; used only for diagnostics, never for
    /// correlation (correlation is always by key, not by timestamp).
    pub received_at: i64,
}

/// The key a `ForwardResponse` is matched against.
///
/// User ops correlate on `(session_id, xid)`; session ops (`NewSession`/`UpdateSession`) on a
/// sender-assigned `internal_id`, because a session doesn't have a stable xid yet when it's
/// being created. `SyncSessions` forwards are fire-and-forget from the correlation standpoint:
/// the leader applies them but a follower does not block anything on their response, so they
/// carry a sender-side token only for de-duplication in logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Correlation {
    UserOp { session_id: i64, xid: i64 },
    Session { internal_id: i64 },
    Sync { token: u64 },
}

/// The body of a forwarded request, tagged by `ForwardKind` on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ForwardBody {
    UserOp(RequestForSession),
    NewSession { internal_id: i64, session_id: i64, timeout_ms: i64 },
    UpdateSession { internal_id: i64, session_id: i64, timeout_ms: i64 },
    SyncSessions { token: u64, sessions: std::collections::HashMap<i64, i64> },
}

/// A request shipped from a follower to the leader for Raft admission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub origin_server_id: NodeId,
    /// The lane on the origin server this request was submitted on; the leader routes its
    /// response back using this plus `origin_server_id`.
    pub origin_lane: usize,
    pub body: ForwardBody,
    /// Milliseconds since the epoch when this request was handed to `conn.send`. The deadline
    /// for a response is `send_time + operation_timeout_ms`.
    pub send_time: i64,
}

impl ForwardRequest {
    pub fn correlation(&self) -> Correlation {
        match &self.body {
            ForwardBody::UserOp(req) => Correlation::UserOp { session_id: req.session_id, xid: req.xid },
            ForwardBody::NewSession { internal_id, .. } => Correlation::Session { internal_id: *internal_id },
            ForwardBody::UpdateSession { internal_id, .. } => Correlation::Session { internal_id: *internal_id },
            ForwardBody::SyncSessions { token, .. } => Correlation::Sync { token: *token },
        }
    }
}

/// The response a leader sends back for a `ForwardRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub correlation: Correlation,
    /// `true` means the leader committed this entry; `false` means it was rejected, either at
    /// admission (not leader, log full) or by Raft itself, with `raft_code` carrying the reason.
    /// Unlike a bare accept/reject ack, this response is only ever sent once the outcome is
    /// final, so it is safe to treat as the terminal response for the correlated request.
    pub accepted: bool,
    pub raft_code: RaftCode,
    /// The committed state machine response, present when `accepted` is true and the body was a
    /// `UserOp` (session-management bodies have no payload to return).
    pub response: Option<ClientResponse>,
}

impl ForwardResponse {
    /// Whether this response matches `request`'s correlation key. Mirrors the source's
    /// `findAndRemove` semantics: matched purely by key, not by queue position, to tolerate the
    /// leader replying to independent sessions out of send order.
    pub fn matches(&self, request: &ForwardRequest) -> bool {
        self.correlation == request.correlation()
    }
}

/// The tag byte identifying a forward frame's payload kind on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    UserOp = 1,
    NewSession = 2,
    UpdateSession = 3,
    SyncSessions = 4,
    Heartbeat = 5,
}

impl FrameKind {
    pub fn of(body: &ForwardBody) -> Self {
        match body {
            ForwardBody::UserOp(_) => FrameKind::UserOp,
            ForwardBody::NewSession { .. } => FrameKind::NewSession,
            ForwardBody::UpdateSession { .. } => FrameKind::UpdateSession,
            ForwardBody::SyncSessions { .. } => FrameKind::SyncSessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_memstore::KeeperOp;

    fn sample_request() -> ForwardRequest {
        ForwardRequest {
            origin_server_id: 2,
            origin_lane: 0,
            body: ForwardBody::UserOp(RequestForSession {
                session_id: 42,
                xid: 7,
                request: ClientRequest {
                    session_id: 42,
                    xid: 7,
                    op: KeeperOp::Create { path: "/x".into(), data: b"v".to_vec(), ephemeral: false },
                },
                received_at: 0,
            }),
            send_time: 0,
        }
    }

    #[test]
    fn user_op_correlates_on_session_and_xid() {
        let req = sample_request();
        let resp = ForwardResponse {
            correlation: Correlation::UserOp { session_id: 42, xid: 7 },
            accepted: true,
            raft_code: RaftCode::Ok,
            response: None,
        };
        assert!(resp.matches(&req));

        let stale = ForwardResponse { correlation: Correlation::UserOp { session_id: 42, xid: 6 }, ..resp };
        assert!(!stale.matches(&req));
    }
}
