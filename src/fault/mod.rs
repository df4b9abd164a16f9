//! Fault-tolerance primitives
//!
//! Building blocks for resilient operations:
//! - [`RetryExecutor`]: bounded retries with fixed, linear, or exponential
//!   backoff and a configurable set of retryable error kinds
//! - [`CircuitBreaker`]: fails fast while a downstream dependency is
//!   unhealthy and probes for recovery
//! - [`CheckpointManager`]: crash-safe progress snapshots for resumable
//!   long-running operations

pub mod checkpoint;
pub mod circuit;
pub mod retry;

pub use checkpoint::{AutoCheckpoint, Checkpoint, CheckpointManager, CheckpointStats};
pub use circuit::{BreakerState, BreakerStatus, CircuitBreaker, CircuitBreakerConfig};
pub use retry::{RetryConfig, RetryExecutor, RetryStats, RetryStrategy};
