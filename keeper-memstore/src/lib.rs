//! An in-memory `RaftStorage` implementation plus the hierarchical keeper state machine it
//! drives.
//!
//! This crate plays the role of the Raft log-storage engine, the snapshot engine, and the
//! in-memory data tree — all three are named as out-of-scope collaborators by the dispatch
//! pipeline this workspace builds. It exists so the dispatch pipeline has a concrete, real
//! `Raft` actor to drive in its tests rather than a mock.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use keeper_raft::Entry;
use keeper_raft::EntryPayload;
use keeper_raft::HardState;
use keeper_raft::InitialState;
use keeper_raft::LogId;
use keeper_raft::MembershipConfig;
use keeper_raft::NodeId;
use keeper_raft::RaftStorage;
use keeper_raft::RaftStorageDebug;
use keeper_raft::Snapshot;
use keeper_raft::SnapshotMeta;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

/// A single operation a session can submit through the dispatch pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KeeperOp {
    Create { path: String, data: Vec<u8>, ephemeral: bool },
    SetData { path: String, data: Vec<u8> },
    Delete { path: String },
    /// Admits a brand new session, assigning it `timeout_ms`.
    NewSession { session_id: i64, timeout_ms: i64 },
    /// Extends an existing session's timeout (a ping / heartbeat from the client).
    UpdateSession { session_id: i64, timeout_ms: i64 },
    CloseSession { session_id: i64 },
    /// A follower's periodic broadcast of its locally-owned sessions, applied on the leader.
    SyncSessions { sessions: HashMap<i64, i64> },
}

/// The `AppData` type replicated through the Raft log: one user or session operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientRequest {
    pub session_id: i64,
    pub xid: i64,
    pub op: KeeperOp,
}

impl keeper_raft::AppData for ClientRequest {}

/// The `AppDataResponse` type produced when a `ClientRequest` is applied to the state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClientResponse {
    Ok,
    Data(Vec<u8>),
    NoNode,
    SessionExpired,
}

impl keeper_raft::AppDataResponse for ClientResponse {}

/// The error returned by `apply_to_state_machine` when the node must step down rather than
/// continue applying entries. This store never needs to, but the type is required by
/// `RaftStorage`.
#[derive(Debug, thiserror::Error)]
#[error("keeper-memstore shutdown error")]
pub struct ShutdownError;

/// The hierarchical namespace plus session registry this store replicates.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct StateMachine {
    pub last_applied_log: LogId,
    pub membership: MembershipConfig,
    /// path -> node data.
    pub tree: BTreeMap<String, Vec<u8>>,
    /// session_id -> expiration_time (unix millis).
    pub sessions: HashMap<i64, i64>,
}

struct MemStoreSnapshot {
    meta: SnapshotMeta,
    data: Vec<u8>,
}

/// An in-memory `RaftStorage` implementation backing one keeper node.
pub struct MemStore {
    id: NodeId,
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    sm: RwLock<StateMachine>,
    hs: RwLock<Option<HardState>>,
    current_snapshot: RwLock<Option<MemStoreSnapshot>>,
}

impl MemStore {
    pub fn new(id: NodeId) -> Self {
        let log = RwLock::new(BTreeMap::new());
        let sm = RwLock::new(StateMachine::default());
        let hs = RwLock::new(None);
        let current_snapshot = RwLock::new(None);
        Self { id, log, sm, hs, current_snapshot }
    }

    /// Apply `entry` to the state machine, returning the response it produces.
    ///
    /// Extends the owning session's expiration time on every request, per the rule that a
    /// session's liveness is renewed by any committed request it submits.
    async fn apply(&self, entry: &Entry<ClientRequest>) -> ClientResponse {
        match &entry.payload {
            EntryPayload::Blank => ClientResponse::Ok,
            EntryPayload::ConfigChange(_) => ClientResponse::Ok,
            EntryPayload::SnapshotPointer(_) => ClientResponse::Ok,
            EntryPayload::Normal(req) => {
                let data = &req.data;
                let mut sm = self.sm.write().await;
                sm.last_applied_log = entry.log_id;
                match &data.op {
                    KeeperOp::NewSession { session_id, timeout_ms } => {
                        sm.sessions.insert(*session_id, now_millis() + timeout_ms);
                        ClientResponse::Ok
                    }
                    KeeperOp::UpdateSession { session_id, timeout_ms } => {
                        sm.sessions.insert(*session_id, now_millis() + timeout_ms);
                        ClientResponse::Ok
                    }
                    KeeperOp::CloseSession { session_id } => {
                        sm.sessions.remove(session_id);
                        ClientResponse::Ok
                    }
                    KeeperOp::SyncSessions { sessions } => {
                        for (sid, exp) in sessions {
                            let entry = sm.sessions.entry(*sid).or_insert(*exp);
                            if *exp > *entry {
                                *entry = *exp;
                            }
                        }
                        ClientResponse::Ok
                    }
                    KeeperOp::Create { path, data, .. } => {
                        sm.tree.insert(path.clone(), data.clone());
                        bump_session(&mut sm.sessions, data_session(req));
                        ClientResponse::Ok
                    }
                    KeeperOp::SetData { path, data } => {
                        if !sm.tree.contains_key(path) {
                            return ClientResponse::NoNode;
                        }
                        sm.tree.insert(path.clone(), data.clone());
                        bump_session(&mut sm.sessions, data_session(req));
                        ClientResponse::Ok
                    }
                    KeeperOp::Delete { path } => {
                        sm.tree.remove(path);
                        bump_session(&mut sm.sessions, data_session(req));
                        ClientResponse::Ok
                    }
                }
            }
        }
    }

    // -- SessionManager view, consumed by the dispatch pipeline's RaftHandle adapter. --

    /// Snapshot of every session this node's state machine currently considers live.
    pub async fn session_to_expiration_time(&self) -> HashMap<i64, i64> {
        self.sm.read().await.sessions.clone()
    }

    /// Ingest a follower's session-sync entry directly (used by tests; production code goes
    /// through the normal Raft log as a `SyncSessions` op so the update is replicated).
    pub async fn handle_remote_session(&self, session_id: i64, expiration_time: i64) {
        let mut sm = self.sm.write().await;
        let entry = sm.sessions.entry(session_id).or_insert(expiration_time);
        if expiration_time > *entry {
            *entry = expiration_time;
        }
    }

    /// Sessions whose expiration has already passed as of `now`.
    pub async fn get_dead_sessions(&self, now: i64) -> Vec<i64> {
        self.sm.read().await.sessions.iter().filter(|(_, exp)| **exp < now).map(|(sid, _)| *sid).collect()
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn data_session(req: &ClientRequest) -> i64 {
    req.session_id
}

fn bump_session(sessions: &mut HashMap<i64, i64>, session_id: i64) {
    if let Some(exp) = sessions.get_mut(&session_id) {
        // A default grace extension; real timeout bookkeeping lives with the session's
        // NewSession/UpdateSession entries. This just keeps a session alive while it is active.
        *exp = now_millis() + 30_000;
    }
}

#[async_trait]
impl RaftStorage<ClientRequest, ClientResponse> for MemStore {
    type SnapshotData = Cursor<Vec<u8>>;
    type ShutdownError = ShutdownError;

    async fn get_membership_config(&self) -> Result<MembershipConfig> {
        let log = self.log.read().await;
        let cfg_opt = log
            .values()
            .rev()
            .filter_map(|entry| match &entry.payload {
                EntryPayload::ConfigChange(cfg) => Some(cfg.membership.clone()),
                _ => None,
            })
            .next();
        Ok(match cfg_opt {
            Some(cfg) => cfg,
            None => MembershipConfig::new_initial(self.id),
        })
    }

    async fn get_initial_state(&self) -> Result<InitialState> {
        let membership = self.get_membership_config().await?;
        let mut hs = self.hs.write().await;
        match &*hs {
            Some(inner) => {
                let log = self.log.read().await;
                let last = log.values().last().map(|e| e.log_id).unwrap_or_default();
                let sm = self.sm.read().await;
                Ok(InitialState {
                    last_log_id: last,
                    last_applied_log: sm.last_applied_log,
                    hard_state: inner.clone(),
                    membership,
                })
            }
            None => {
                let new = InitialState::new_initial(self.id);
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    async fn save_hard_state(&self, hard_state: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hard_state.clone());
        Ok(())
    }

    async fn get_log_entries<RNG>(&self, range: RNG) -> Result<Vec<Entry<ClientRequest>>>
    where RNG: std::ops::RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, v)| v.clone()).collect())
    }

    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<ClientRequest>>> {
        Ok(self.log.read().await.get(&log_index).cloned())
    }

    async fn get_last_log_id(&self) -> Result<LogId> {
        let log = self.log.read().await;
        let last_log = log.values().last().map(|e| e.log_id).unwrap_or_default();
        let sm = self.sm.read().await;
        Ok(std::cmp::max(last_log, sm.last_applied_log))
    }

    async fn delete_logs_from<RNG>(&self, range: RNG) -> Result<()>
    where RNG: std::ops::RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(range).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn append_to_log(&self, entries: &[&Entry<ClientRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    async fn apply_to_state_machine(&self, entries: &[&Entry<ClientRequest>]) -> Result<Vec<ClientResponse>> {
        let mut responses = Vec::with_capacity(entries.len());
        for entry in entries {
            responses.push(self.apply(entry).await);
        }
        Ok(responses)
    }

    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>> {
        let (membership, last_applied_log, data);
        {
            let sm = self.sm.read().await;
            membership = sm.membership.clone();
            last_applied_log = sm.last_applied_log;
            data = serde_json::to_vec(&*sm)?;
        }

        let snapshot_id = format!("{}-{}", last_applied_log.term, last_applied_log.index);
        let meta = SnapshotMeta { last_log_id: last_applied_log, membership, snapshot_id };

        *self.current_snapshot.write().await = Some(MemStoreSnapshot { meta: meta.clone(), data: data.clone() });

        {
            let mut log = self.log.write().await;
            let keep_from = last_applied_log.index;
            let keys: Vec<u64> = log.range(..keep_from).map(|(k, _)| *k).collect();
            for key in keys {
                log.remove(&key);
            }
        }

        Ok(Snapshot { meta, snapshot: Box::new(Cursor::new(data)) })
    }

    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn finalize_snapshot_installation(&self, meta: &SnapshotMeta, snapshot: Box<Self::SnapshotData>) -> Result<()> {
        let data = snapshot.into_inner();
        let new_sm: StateMachine = serde_json::from_slice(&data)?;

        {
            let mut log = self.log.write().await;
            let keys: Vec<u64> = log.range(..=meta.last_log_id.index).map(|(k, _)| *k).collect();
            for key in keys {
                log.remove(&key);
            }
        }

        *self.sm.write().await = new_sm;
        *self.current_snapshot.write().await = Some(MemStoreSnapshot { meta: meta.clone(), data });
        Ok(())
    }

    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        Ok(match &*self.current_snapshot.read().await {
            Some(snap) => Some(Snapshot { meta: snap.meta.clone(), snapshot: Box::new(Cursor::new(snap.data.clone())) }),
            None => None,
        })
    }
}

#[async_trait]
impl RaftStorageDebug<StateMachine> for MemStore {
    async fn get_state_machine(&self) -> StateMachine {
        self.sm.read().await.clone()
    }

    async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_session_then_sync_extends_expiration() {
        let store = MemStore::new(1);
        store.handle_remote_session(42, 1_000).await;
        store.handle_remote_session(42, 2_000).await;
        let map = store.session_to_expiration_time().await;
        assert_eq!(map.get(&42), Some(&2_000));
    }

    #[tokio::test]
    async fn dead_sessions_are_those_already_expired() {
        let store = MemStore::new(1);
        store.handle_remote_session(1, 10).await;
        store.handle_remote_session(2, 10_000_000_000_000).await;
        let dead = store.get_dead_sessions(1_000).await;
        assert_eq!(dead, vec![1]);
    }
}
