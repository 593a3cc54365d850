//! `Dispatcher`: the facade the network front-end and the Raft collaborator's apply callback
//! both talk to. Owns every worker pool and the lifecycle state machine
//! `Init → Running → ShuttingDown → Stopped`.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::accumulator::RequestAccumulator;
use crate::callbacks::CallbackRegistries;
use crate::callbacks::SessionCallbackKey;
use crate::callbacks::UserCallback;
use crate::config::Config;
use crate::connection::ForwardConnectionPool;
use crate::error::DispatchError;
use crate::error::DispatchResult;
use crate::forward::RequestForSession;
use crate::forwarder::RequestForwarder;
use crate::processor::RequestProcessor;
use crate::processor::ResponseForSession;
use crate::raft_handle::RaftHandle;
use crate::requests_queue::LaneReceiver;
use crate::requests_queue::RequestsQueue;
use crate::session::InternalIdAllocator;
use crate::stats::ConnectionStats;
use keeper_memstore::ClientRequest;
use keeper_memstore::KeeperOp;
use keeper_raft::NodeId;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as i64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Init = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl From<u8> for LifecycleState {
    fn from(v: u8) -> Self {
        match v {
            1 => LifecycleState::Running,
            2 => LifecycleState::ShuttingDown,
            3 => LifecycleState::Stopped,
            _ => LifecycleState::Init,
        }
    }
}

pub struct Dispatcher {
    config: Arc<Config>,
    raft: Arc<dyn RaftHandle>,
    requests_queue: RequestsQueue,
    callbacks: Arc<CallbackRegistries>,
    pool: Arc<ForwardConnectionPool>,
    accumulators: Vec<Arc<RequestAccumulator>>,
    forwarders: Vec<Arc<RequestForwarder>>,
    stats: Arc<ConnectionStats>,
    internal_ids: InternalIdAllocator,
    state: AtomicU8,
    shutdown_tx: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Build a dispatcher and every per-lane worker. Returns the dispatcher plus the lane
    /// receivers; call `start` to actually spawn the worker tasks.
    pub fn new(config: Arc<Config>, raft: Arc<dyn RaftHandle>) -> (Arc<Self>, Vec<LaneReceiver>) {
        let (requests_queue, receivers) = RequestsQueue::new(config.parallel, config.requests_queue_capacity);
        let callbacks = Arc::new(CallbackRegistries::new());
        let pool = Arc::new(ForwardConnectionPool::new(config.parallel));
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let processor = Arc::new(RequestProcessor::new(responses_tx));
        let (shutdown_tx, _) = watch::channel(false);
        let stats = Arc::new(ConnectionStats::new());

        let accumulators = (0..config.parallel)
            .map(|lane| Arc::new(RequestAccumulator::new(lane, raft.clone(), processor.clone())))
            .collect();
        let forwarders = (0..config.parallel)
            .map(|lane| Arc::new(RequestForwarder::new(lane, raft.my_id(), config.clone(), raft.clone(), pool.clone(), processor.clone(), stats.clone())))
            .collect();

        let internal_ids = InternalIdAllocator::new(raft.my_id());
        let dispatcher = Arc::new(Self {
            config,
            raft,
            requests_queue,
            callbacks,
            pool,
            accumulators,
            forwarders,
            stats,
            internal_ids,
            state: AtomicU8::new(LifecycleState::Init as u8),
            shutdown_tx,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        });
        dispatcher.spawn_response_worker(responses_rx);
        (dispatcher, receivers)
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: LifecycleState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Spawn the per-lane request workers, the forwarder receive/sync loops, the dead-session
    /// cleaner and the config-update listener. Consumes `lane_receivers` from `new`.
    pub async fn start(self: &Arc<Self>, lane_receivers: Vec<LaneReceiver>) {
        self.set_state(LifecycleState::Running);
        let mut tasks = self.tasks.lock().await;

        for lane_rx in lane_receivers {
            let lane = lane_rx.lane;
            let me = self.clone();
            tasks.push(tokio::spawn(me.request_worker(lane_rx)));

            let forwarder = self.forwarders[lane].clone();
            tasks.push(tokio::spawn(forwarder.clone().run_receive_loop(self.shutdown_tx.subscribe())));
            tasks.push(tokio::spawn(forwarder.run_session_sync_loop(self.callbacks.clone(), self.shutdown_tx.subscribe())));
        }

        tasks.push(tokio::spawn(self.clone().dead_session_cleaner()));
        tasks.push(tokio::spawn(self.clone().config_update_listener()));
    }

    /// One lane's request worker: pulls admitted requests and, each time, decides whether to
    /// submit locally (leader) or forward to the current leader (follower), re-checking on every
    /// batch since leadership can change mid-stream.
    async fn request_worker(self: Arc<Self>, mut lane_rx: LaneReceiver) {
        let lane = lane_rx.lane;
        let accumulator = self.accumulators[lane].clone();
        let forwarder = self.forwarders[lane].clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                first = lane_rx.try_pop(self.config.operation_timeout()) => {
                    if let Some(first) = first {
                        if self.raft.is_leader().await {
                            let mut batch = vec![first];
                            while batch.len() < self.config.max_batch_size {
                                match lane_rx.try_pop_now() {
                                    Some(req) => batch.push(req),
                                    None => break,
                                }
                            }
                            accumulator.submit_batch(batch).await;
                        } else {
                            let session_id = first.session_id;
                            if let Err(err) = forwarder.forward_user(first).await {
                                tracing::debug!(lane, session_id, %err, "forward failed");
                            }
                        }
                    }
                }
            }
        }
        accumulator.fail_batch(lane_rx.drain_now(), DispatchError::Shutdown);
    }

    fn spawn_response_worker(self: &Arc<Self>, mut responses_rx: mpsc::UnboundedReceiver<ResponseForSession>) {
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move {
            while let Some(resp) = responses_rx.recv().await {
                if resp.is_session_op {
                    let internal_id = resp.session_id;
                    callbacks.invoke_session(SessionCallbackKey::InternalId(internal_id), resp).await;
                } else {
                    callbacks.invoke_user(resp).await;
                }
            }
        });
    }

    async fn dead_session_cleaner(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.dead_session_check_period());
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => { if *shutdown.borrow() { return } }
                _ = ticker.tick() => {
                    let dead = self.raft.get_dead_sessions(now_ms()).await;
                    for session_id in dead {
                        self.callbacks.unregister_user(session_id).await;
                        self.callbacks.unregister_session(SessionCallbackKey::SessionId(session_id)).await;
                    }
                }
            }
        }
    }

    async fn config_update_listener(self: Arc<Self>) {
        let mut rx = self.raft.subscribe_cluster_config();
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => { if *shutdown.borrow() { return } }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let config = rx.borrow().clone();
                    let (added, removed) = self.pool.reconcile(&config).await;
                    tracing::info!(?added, ?removed, "forward connection pool reconciled");
                }
            }
        }
    }

    /// Admit a user request: routes to its session's lane, registering nothing itself — the
    /// caller is expected to have already registered a callback for `session_id` via
    /// `register_user` when the session was created.
    pub fn push_request(&self, session_id: i64, xid: i64, op: KeeperOp) -> DispatchResult<()> {
        if self.state() != LifecycleState::Running {
            return Err(DispatchError::Shutdown);
        }
        self.requests_queue.push(RequestForSession {
            session_id,
            xid,
            request: ClientRequest { session_id, xid, op },
            received_at: now_ms(),
        })
    }

    /// Allocate the next `internal_id` for a new-session/update-session request. Callers (the
    /// network front-end) must call this before `push_session_request` so the id travels with the
    /// request from the start.
    pub async fn allocate_internal_id(&self) -> i64 {
        let stride = self.raft.cluster_node_count().await;
        self.internal_ids.allocate(stride)
    }

    /// Admit a new-session or update-session op. `internal_id` is allocated by the caller via
    /// `allocate_internal_id` and travels with the request so a forward response can be
    /// correlated back before the session has a stable `session_id`/`xid` of its own to key on.
    pub fn push_session_request(&self, session_id: i64, timeout_ms: i64, internal_id: i64) -> DispatchResult<()> {
        if self.state() != LifecycleState::Running {
            return Err(DispatchError::Shutdown);
        }
        let op = KeeperOp::NewSession { session_id, timeout_ms };
        self.requests_queue.push(RequestForSession {
            session_id,
            xid: internal_id,
            request: ClientRequest { session_id, xid: internal_id, op },
            received_at: now_ms(),
        })
    }

    /// Admit a request forwarded *to* us by a follower, i.e. we must currently be leader. The
    /// network layer that accepted the inbound forward connection calls this and ships whatever
    /// `ForwardResponse` it returns back on that same socket; actually owning that socket is
    /// outside this crate's scope.
    pub async fn push_forward_request(&self, body: crate::forward::ForwardBody) -> crate::forward::ForwardResponse {
        use crate::error::RaftCode;
        use crate::forward::ForwardBody;
        use crate::forward::ForwardResponse;

        let correlation = crate::forward::ForwardRequest { origin_server_id: 0, origin_lane: 0, body: body.clone(), send_time: 0 }.correlation();

        if !self.raft.is_leader().await {
            return ForwardResponse { correlation, accepted: false, raft_code: RaftCode::Failed, response: None };
        }

        match body {
            ForwardBody::UserOp(req) => {
                let mut outcomes = self.raft.append_entry(vec![req]).await;
                let (_, _, result) = outcomes.pop().expect("single-entry batch yields one outcome");
                match result {
                    Ok(response) => ForwardResponse { correlation, accepted: true, raft_code: RaftCode::Ok, response: Some(response) },
                    Err(_) => ForwardResponse { correlation, accepted: false, raft_code: RaftCode::Failed, response: None },
                }
            }
            ForwardBody::NewSession { session_id, timeout_ms, .. } | ForwardBody::UpdateSession { session_id, timeout_ms, .. } => {
                let op = KeeperOp::NewSession { session_id, timeout_ms };
                let mut outcomes = self.raft.append_entry(vec![RequestForSession { session_id, xid: 0, request: ClientRequest { session_id, xid: 0, op }, received_at: now_ms() }]).await;
                let (_, _, result) = outcomes.pop().expect("single-entry batch yields one outcome");
                ForwardResponse { correlation, accepted: result.is_ok(), raft_code: if result.is_ok() { RaftCode::Ok } else { RaftCode::Failed }, response: None }
            }
            ForwardBody::SyncSessions { sessions, .. } => {
                self.raft.handle_remote_session(sessions).await;
                ForwardResponse { correlation, accepted: true, raft_code: RaftCode::Ok, response: None }
            }
        }
    }

    pub async fn register_user(&self, session_id: i64, cb: UserCallback, is_reconnect: bool) {
        self.callbacks.register_user(session_id, cb, is_reconnect).await;
    }

    pub async fn unregister_user(&self, session_id: i64) {
        self.callbacks.unregister_user(session_id).await;
    }

    pub async fn register_session(&self, key: SessionCallbackKey, cb: UserCallback) {
        self.callbacks.register_session(key, cb).await;
    }

    pub async fn unregister_session(&self, key: SessionCallbackKey) {
        self.callbacks.unregister_session(key).await;
    }

    pub async fn filter_local_sessions(&self, sessions: &mut std::collections::HashMap<i64, i64>) {
        self.callbacks.filter_local_sessions(sessions).await;
    }

    pub async fn is_local_session(&self, session_id: i64) -> bool {
        self.callbacks.is_local_session(session_id).await
    }

    pub fn my_id(&self) -> NodeId {
        self.raft.my_id()
    }

    /// Aggregate forward-connection packet/latency counters across every lane, for whatever
    /// admin/metrics surface the embedder exposes.
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Transition to `ShuttingDown`, signal every worker, wait for them to drain, then
    /// transition to `Stopped`.
    pub async fn shutdown(self: &Arc<Self>) {
        self.set_state(LifecycleState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        self.set_state(LifecycleState::Stopped);
    }
}
