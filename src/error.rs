//! Crate-wide error taxonomy
//!
//! Every failure that crosses a subsystem boundary is one of the kinds
//! below. The retry executor and circuit breaker dispatch on
//! [`TaskError::kind`] rather than on concrete types, so the kind names are
//! part of the public contract and must stay stable.

use thiserror::Error;

/// Errors surfaced by task execution across all layers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// The user callable failed. Surfaced on that task's future only.
    #[error("task failed: {0}")]
    TaskFailure(String),

    /// A wait exceeded its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// A submission was made after shutdown.
    #[error("executor is shut down")]
    Shutdown,

    /// The circuit breaker rejected the call without executing it.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The retry cap was reached; carries the last underlying error.
    #[error("all {attempts} attempts exhausted: {last}")]
    AllRetriesExhausted {
        /// Number of attempts that were made.
        attempts: u32,
        /// The error from the final attempt.
        last: Box<TaskError>,
    },

    /// The load balancer found no node meeting the requirements.
    #[error("no eligible node available")]
    NoEligibleNode,

    /// A cluster node stopped heartbeating while owning work.
    #[error("node failed: {0}")]
    NodeFailed(String),

    /// An out-of-memory-class failure inside the parallel engine.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A persisted checkpoint could not be decoded.
    #[error("checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),
}

impl TaskError {
    /// Stable kind name for this error, used by retry classification.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::TaskFailure(_) => "task_failure",
            TaskError::Timeout(_) => "timeout",
            TaskError::Shutdown => "shutdown",
            TaskError::CircuitOpen => "circuit_open",
            TaskError::AllRetriesExhausted { .. } => "all_retries_exhausted",
            TaskError::NoEligibleNode => "no_eligible_node",
            TaskError::NodeFailed(_) => "node_failed",
            TaskError::ResourceExhausted(_) => "resource_exhausted",
            TaskError::CheckpointCorrupt(_) => "checkpoint_corrupt",
        }
    }

    /// Whether this error is transient enough that a caller may retry
    /// without changing anything.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TaskError::Timeout(_)
                | TaskError::NoEligibleNode
                | TaskError::NodeFailed(_)
                | TaskError::ResourceExhausted(_)
        )
    }
}

/// Result type for task operations.
pub type TaskResult<T> = Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(TaskError::TaskFailure("x".into()).kind(), "task_failure");
        assert_eq!(TaskError::Timeout("join".into()).kind(), "timeout");
        assert_eq!(TaskError::Shutdown.kind(), "shutdown");
        assert_eq!(TaskError::CircuitOpen.kind(), "circuit_open");
        assert_eq!(TaskError::NoEligibleNode.kind(), "no_eligible_node");
    }

    #[test]
    fn test_exhausted_carries_last_error() {
        let err = TaskError::AllRetriesExhausted {
            attempts: 3,
            last: Box::new(TaskError::TaskFailure("boom".into())),
        };

        assert_eq!(err.kind(), "all_retries_exhausted");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(TaskError::NoEligibleNode.is_transient());
        assert!(TaskError::NodeFailed("n1".into()).is_transient());
        assert!(!TaskError::Shutdown.is_transient());
        assert!(!TaskError::CircuitOpen.is_transient());
    }
}
