//! Runtime configuration for a Raft node.

use std::sync::Arc;

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Log compaction policy.
///
/// Dictates the conditions under which log compaction (snapshotting) will be triggered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// Compact the log once it has grown by the given number of logs since the last snapshot.
    LogsSinceLast(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::LogsSinceLast(5000)
    }
}

/// Errors which may be returned when building a `Config`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("election_timeout_min ({0}) must be < election_timeout_max ({1})")]
    ElectionTimeoutRangeInvalid(u64, u64),

    #[error("heartbeat_interval ({0}) must be <= election_timeout_min ({1}), else elections may be triggered unnecessarily")]
    HeartbeatIntervalTooLarge(u64, u64),

    #[error("max_payload_entries must be > 0")]
    MaxPayloadEntriesZero,
}

/// The runtime configuration for a Raft node.
///
/// The values here are static for the lifetime of the node: reloading or mutating a running
/// node's config is not supported by this crate; build a new one and restart the node instead.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// A name for this cluster, used for namespacing tracing spans and logs.
    pub cluster_name: String,
    /// The minimum election timeout, in milliseconds. A follower or candidate that hasn't heard
    /// from a leader for a randomly chosen duration in `[election_timeout_min,
    /// election_timeout_max)` will start a new election.
    pub election_timeout_min: u64,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: u64,
    /// The interval, in milliseconds, at which leaders send heartbeats to followers.
    pub heartbeat_interval: u64,
    /// The timeout, in milliseconds, allotted for installing a snapshot chunk.
    pub install_snapshot_timeout: u64,
    /// The maximum number of entries per payload allowed to be replicated in a single append
    /// entries request.
    pub max_payload_entries: u64,
    /// The maximum number of bytes sent in a single snapshot chunk.
    pub snapshot_max_chunk_size: u64,
    /// The log compaction policy.
    pub snapshot_policy: SnapshotPolicy,
    /// The number of entries a replication target may lag behind the leader before a snapshot is
    /// forced rather than resuming with normal log replication.
    pub replication_lag_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::default().build().expect("default config is always valid")
    }
}

impl Config {
    /// Start a new `ConfigBuilder`, defaulting `cluster_name` to "keeper".
    pub fn build(cluster_name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name: cluster_name.into(),
            ..Default::default()
        }
    }

    /// Generate a new random election timeout within `[election_timeout_min,
    /// election_timeout_max)`.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A builder for a Raft node's `Config`, providing sane defaults and validation.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: u64,
    election_timeout_max: u64,
    heartbeat_interval: u64,
    install_snapshot_timeout: u64,
    max_payload_entries: u64,
    snapshot_max_chunk_size: u64,
    snapshot_policy: SnapshotPolicy,
    replication_lag_threshold: u64,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            cluster_name: "keeper".into(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            install_snapshot_timeout: 200,
            max_payload_entries: 300,
            snapshot_max_chunk_size: 3 * 1024 * 1024,
            snapshot_policy: SnapshotPolicy::default(),
            replication_lag_threshold: 1000,
        }
    }
}

impl ConfigBuilder {
    pub fn cluster_name(mut self, v: impl Into<String>) -> Self {
        self.cluster_name = v.into();
        self
    }

    pub fn election_timeout_min(mut self, v: u64) -> Self {
        self.election_timeout_min = v;
        self
    }

    pub fn election_timeout_max(mut self, v: u64) -> Self {
        self.election_timeout_max = v;
        self
    }

    pub fn heartbeat_interval(mut self, v: u64) -> Self {
        self.heartbeat_interval = v;
        self
    }

    pub fn install_snapshot_timeout(mut self, v: u64) -> Self {
        self.install_snapshot_timeout = v;
        self
    }

    pub fn max_payload_entries(mut self, v: u64) -> Self {
        self.max_payload_entries = v;
        self
    }

    pub fn snapshot_max_chunk_size(mut self, v: u64) -> Self {
        self.snapshot_max_chunk_size = v;
        self
    }

    pub fn snapshot_policy(mut self, v: SnapshotPolicy) -> Self {
        self.snapshot_policy = v;
        self
    }

    pub fn replication_lag_threshold(mut self, v: u64) -> Self {
        self.replication_lag_threshold = v;
        self
    }

    /// Validate and build the final, immutable `Config`, wrapped in an `Arc`.
    pub fn validate(self) -> Result<Arc<Config>, ConfigError> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::ElectionTimeoutRangeInvalid(
                self.election_timeout_min,
                self.election_timeout_max,
            ));
        }
        if self.heartbeat_interval > self.election_timeout_min {
            return Err(ConfigError::HeartbeatIntervalTooLarge(self.heartbeat_interval, self.election_timeout_min));
        }
        if self.max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesZero);
        }
        Ok(Arc::new(Config {
            cluster_name: self.cluster_name,
            election_timeout_min: self.election_timeout_min,
            election_timeout_max: self.election_timeout_max,
            heartbeat_interval: self.heartbeat_interval,
            install_snapshot_timeout: self.install_snapshot_timeout,
            max_payload_entries: self.max_payload_entries,
            snapshot_max_chunk_size: self.snapshot_max_chunk_size,
            snapshot_policy: self.snapshot_policy,
            replication_lag_threshold: self.replication_lag_threshold,
        }))
    }

    /// Build without wrapping validation errors, for use from `Default`.
    fn build(self) -> Result<Config, ConfigError> {
        self.validate().map(|arc| (*arc).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_election_timeout_range() {
        let err = Config::build("test").election_timeout_min(300).election_timeout_max(150).validate();
        assert!(matches!(err, Err(ConfigError::ElectionTimeoutRangeInvalid(300, 150))));
    }

    #[test]
    fn rejects_heartbeat_larger_than_election_timeout() {
        let err = Config::build("test").heartbeat_interval(1000).validate();
        assert!(matches!(err, Err(ConfigError::HeartbeatIntervalTooLarge(_, _))));
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.cluster_name, "keeper");
    }
}
