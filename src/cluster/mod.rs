//! Distributed execution layer
//!
//! Cluster membership, load balancing, and remote task dispatch:
//! - `node`: member model and hardware capability detection
//! - `protocol`: line-delimited JSON wire messages
//! - `coordinator`: membership server with heartbeat failure detection
//! - `worker`: worker role joining a coordinator and serving dispatches
//! - `balancer`: node selection policies
//! - `executor`: remote dispatch with timeouts and re-dispatch

pub mod balancer;
pub mod coordinator;
pub mod executor;
pub mod node;
pub mod protocol;
pub mod worker;

pub use balancer::{BalanceStrategy, LoadBalancer};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use executor::{DistributedConfig, DistributedExecutor};
pub use node::{
    NodeCapabilities, NodeId, NodeInfo, NodeRole, NodeStatus, TaskRequirements,
};
pub use protocol::{Message, RemoteOutcome};
pub use worker::{ClusterWorker, RemoteTask, WorkerConfig};

use thiserror::Error;

/// Cluster-layer errors.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Socket-level failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A message failed to encode or decode.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A connect or read exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The peer closed the connection mid-exchange.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The coordinator refused the join.
    #[error("join rejected: {0}")]
    JoinRejected(String),

    /// The peer answered with something the protocol does not allow here.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;
