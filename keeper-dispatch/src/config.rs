//! Runtime configuration for the dispatch and forwarding pipeline.
//!
//! Field names mirror the keeper's own `Settings`/`RaftSettings` configuration layer: `parallel`,
//! `operation_timeout_ms`, `dead_session_check_period_ms`, and the `keeper.cluster.server[N]`
//! peer list, each with `id`, `host`, `forwarding_port` (default 8102), and `learner` (default
//! false).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use keeper_raft::NodeId;

/// The network address and role of one cluster peer, as seen by the forward connection pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub id: NodeId,
    pub host: String,
    pub forwarding_port: u16,
    pub learner: bool,
}

impl PeerEndpoint {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.forwarding_port)
    }
}

/// A point-in-time snapshot of the cluster's forwarding topology: every non-learner peer other
/// than `self`, keyed by peer id.
///
/// Rebuilt on every config-reload event; diffed against the live connection pool by
/// `ForwardConnectionPool::reconcile`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub peers: BTreeMap<NodeId, PeerEndpoint>,
}

impl ClusterConfig {
    pub fn from_servers(self_id: NodeId, servers: impl IntoIterator<Item = PeerEndpoint>) -> Self {
        let peers = servers
            .into_iter()
            .filter(|s| s.id != self_id && !s.learner)
            .map(|s| (s.id, s))
            .collect();
        Self { peers }
    }
}

/// Errors returned while validating a `Config`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parallel must be > 0")]
    ParallelZero,

    #[error("operation_timeout_ms must be > 0")]
    OperationTimeoutZero,

    #[error("forward_queue_capacity must be > 0")]
    ForwardQueueCapacityZero,

    #[error("invalid peer address for node {0}: {1}")]
    InvalidPeerAddress(NodeId, String),
}

/// Runtime configuration for the dispatch and forwarding pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// This node's own id, used to exclude itself from the forward connection pool.
    pub my_id: NodeId,
    /// Number of lanes. Sessions hash to `lane = hash(session_id) % parallel`.
    pub parallel: usize,
    /// Bounded capacity of each lane's `RequestsQueue`.
    pub requests_queue_capacity: usize,
    /// Bounded capacity of each lane's `ForwardRequestQueue` in-flight window.
    pub forward_queue_capacity: usize,
    /// Deadline for an in-flight forward request: `send_time + operation_timeout_ms`.
    pub operation_timeout_ms: u64,
    /// Upstream, client-facing timeout. Surfaced above this core; kept here only so the
    /// dispatcher can reject admission early once it would certainly be exceeded.
    pub client_req_timeout_ms: u64,
    /// Period between a lane's `SyncSessions` forwards, rotated round-robin across lanes.
    pub session_sync_period_ms: u64,
    /// Maximum number of requests coalesced into a single Raft `append_entries` call.
    pub max_batch_size: usize,
    /// Heartbeat interval used by the forward connection keep-alive.
    pub heart_beat_interval_ms: u64,
    /// How often the dead-session cleaner asks the state machine for expired sessions.
    pub dead_session_check_period_ms: u64,
    /// The cluster's forwarding topology.
    pub cluster: ClusterConfig,
}

impl Config {
    pub fn build(my_id: NodeId) -> ConfigBuilder {
        ConfigBuilder { my_id, ..ConfigBuilder::default() }
    }
}

/// A builder for `Config`, providing the reference defaults and validation.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    my_id: NodeId,
    parallel: usize,
    requests_queue_capacity: usize,
    forward_queue_capacity: usize,
    operation_timeout_ms: u64,
    client_req_timeout_ms: u64,
    session_sync_period_ms: u64,
    max_batch_size: usize,
    heart_beat_interval_ms: u64,
    dead_session_check_period_ms: u64,
    cluster: ClusterConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            my_id: 0,
            parallel: 4,
            requests_queue_capacity: 20_000,
            forward_queue_capacity: 20_000,
            operation_timeout_ms: 10_000,
            client_req_timeout_ms: 15_000,
            session_sync_period_ms: 2_000,
            max_batch_size: 100,
            heart_beat_interval_ms: 500,
            dead_session_check_period_ms: 1_000,
            cluster: ClusterConfig::default(),
        }
    }
}

impl ConfigBuilder {
    pub fn parallel(mut self, v: usize) -> Self {
        self.parallel = v;
        self
    }

    pub fn requests_queue_capacity(mut self, v: usize) -> Self {
        self.requests_queue_capacity = v;
        self
    }

    pub fn forward_queue_capacity(mut self, v: usize) -> Self {
        self.forward_queue_capacity = v;
        self
    }

    pub fn operation_timeout_ms(mut self, v: u64) -> Self {
        self.operation_timeout_ms = v;
        self
    }

    pub fn client_req_timeout_ms(mut self, v: u64) -> Self {
        self.client_req_timeout_ms = v;
        self
    }

    pub fn session_sync_period_ms(mut self, v: u64) -> Self {
        self.session_sync_period_ms = v;
        self
    }

    pub fn max_batch_size(mut self, v: usize) -> Self {
        self.max_batch_size = v;
        self
    }

    pub fn heart_beat_interval_ms(mut self, v: u64) -> Self {
        self.heart_beat_interval_ms = v;
        self
    }

    pub fn dead_session_check_period_ms(mut self, v: u64) -> Self {
        self.dead_session_check_period_ms = v;
        self
    }

    pub fn cluster(mut self, v: ClusterConfig) -> Self {
        self.cluster = v;
        self
    }

    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.parallel == 0 {
            return Err(ConfigError::ParallelZero);
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::OperationTimeoutZero);
        }
        if self.forward_queue_capacity == 0 {
            return Err(ConfigError::ForwardQueueCapacityZero);
        }
        // Hostnames that are not literal socket addresses are allowed; only an empty host can
        // never be dialed.
        for peer in self.cluster.peers.values() {
            if peer.host.is_empty() {
                return Err(ConfigError::InvalidPeerAddress(peer.id, "empty host".into()));
            }
        }
        Ok(Config {
            my_id: self.my_id,
            parallel: self.parallel,
            requests_queue_capacity: self.requests_queue_capacity,
            forward_queue_capacity: self.forward_queue_capacity,
            operation_timeout_ms: self.operation_timeout_ms,
            client_req_timeout_ms: self.client_req_timeout_ms,
            session_sync_period_ms: self.session_sync_period_ms,
            max_batch_size: self.max_batch_size,
            heart_beat_interval_ms: self.heart_beat_interval_ms,
            dead_session_check_period_ms: self.dead_session_check_period_ms,
            cluster: self.cluster,
        })
    }
}

impl Config {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn session_sync_period(&self) -> Duration {
        Duration::from_millis(self.session_sync_period_ms)
    }

    pub fn dead_session_check_period(&self) -> Duration {
        Duration::from_millis(self.dead_session_check_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_parallel() {
        let err = Config::build(1).parallel(0).validate().unwrap_err();
        assert!(matches!(err, ConfigError::ParallelZero));
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::build(1).validate().unwrap();
        assert_eq!(cfg.parallel, 4);
        assert_eq!(cfg.forward_queue_capacity, 20_000);
    }
}
