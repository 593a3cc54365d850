//! An implementation of the Raft distributed consensus protocol using the `tokio` runtime for
//! an async, non-blocking, and fully tonic/network-backend-agnostic implementation.
//!
//! This crate provides the `Raft` actor itself: leader election, log replication, snapshotting
//! and dynamic membership changes. Everything above the log (the state machine, the network
//! transport, and the storage engine) is supplied by the embedder through the `RaftStorage` and
//! `RaftNetwork` traits.

pub mod config;
mod core;
pub mod error;
pub mod metrics;
mod network;
mod quorum;
pub mod raft;
mod raft_types;
mod replication;
pub mod storage;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

pub use async_trait;

pub use config::Config;
pub use config::ConfigBuilder;
pub use config::ConfigError;
pub use config::SnapshotPolicy;
pub use core::State;
pub use error::ChangeConfigError;
pub use error::ClientReadError;
pub use error::ClientWriteError;
pub use error::InitializeError;
pub use error::RaftError;
pub use error::RaftResult;
pub use error::ResponseError;
pub use metrics::LeaderMetrics;
pub use metrics::RaftMetrics;
pub use metrics::ReplicationMetrics;
pub use metrics::Wait;
pub use network::RaftNetwork;
pub use raft::AppendEntriesRequest;
pub use raft::AppendEntriesResponse;
pub use raft::ClientWriteRequest;
pub use raft::ClientWriteResponse;
pub use raft::Entry;
pub use raft::EntryPayload;
pub use raft::InstallSnapshotRequest;
pub use raft::InstallSnapshotResponse;
pub use raft::MembershipConfig;
pub use raft::Raft;
pub use raft::VoteRequest;
pub use raft::VoteResponse;
pub use raft_types::SnapshotId;
pub use raft_types::SnapshotSegmentId;
pub use raft_types::Update;
pub use storage::HardState;
pub use storage::InitialState;
pub use storage::RaftStorage;
pub use storage::RaftStorageDebug;
pub use storage::Snapshot;
pub use storage::SnapshotMeta;

/// The identifier of a node in a Raft cluster.
pub type NodeId = u64;

/// The identity of a single entry in the Raft log.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A trait defining application-specific data that will be proposed to the cluster via
/// `Raft::client_write`.
///
/// This type must be safe to send across thread boundaries and must be (de)serializable so that
/// it can be written to the log and sent over the wire to other nodes.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application-specific response data returned from applying a committed entry
/// to the state machine.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait for producing a terse human-readable summary of a type, used for structured tracing
/// without serializing entire payloads into log lines.
pub(crate) trait MessageSummary {
    /// Return a short description of `self`, suitable as a `tracing` field value.
    fn summary(&self) -> String;
}
