//! Request dispatch and forwarding pipeline: the layer between a coordination service's
//! client-facing network front-end and its Raft consensus core.
//!
//! A client request lands on whichever node terminates its TCP connection. If that node is the
//! Raft leader, the request is admitted directly (`RequestAccumulator`); otherwise it is shipped
//! to the current leader over a persistent connection (`RequestForwarder`) and the result is
//! routed back once the leader replies. `Dispatcher` is the facade tying the two paths, the
//! response callback registries, and the session-management view together.
//!
//! The Raft algorithm itself, the wire protocol framer used for client connections, the on-disk
//! write-ahead log, the hierarchical data tree, and process lifecycle are all out of scope here;
//! they are provided by `keeper-raft` and `keeper-memstore`, reached only through `RaftHandle`.

pub mod accumulator;
pub mod callbacks;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod forward;
pub mod forward_queue;
pub mod forwarder;
pub mod processor;
pub mod raft_handle;
pub mod requests_queue;
pub mod session;
pub mod stats;

pub use config::ClusterConfig;
pub use config::Config;
pub use config::ConfigError;
pub use config::PeerEndpoint;
pub use dispatcher::Dispatcher;
pub use dispatcher::LifecycleState;
pub use error::DispatchError;
pub use error::DispatchResult;
pub use error::RaftCode;
pub use raft_handle::KeeperRaftHandle;
pub use raft_handle::RaftHandle;
pub use session::Session;
