//! # FERROX - Parallel and Distributed Task Execution
//!
//! A high-performance task execution library built in Rust.
//!
//! ## Architecture
//!
//! - `concurrent`: sharded map, lock-free queue, atomic counter, RW dict
//! - `cache`: bounded cache with LRU/LFU/TTL/adaptive eviction
//! - `memory`: fixed-size block pool with a free list
//! - `executor`: thread-pool task executor with futures
//! - `ops`: order-preserving parallel map/filter/reduce/starmap
//! - `scheduler`: work-stealing, round-robin, adaptive, and priority
//!   schedulers
//! - `vthread`: cooperative virtual-thread executor over a bounded pool
//! - `cluster`: coordinator/worker membership, load balancing, and
//!   distributed dispatch over TCP/JSON
//! - `fault`: retry executor, circuit breaker, checkpoint manager

#![warn(missing_docs)]
#![warn(clippy::all)]

// Concurrency primitives
pub mod concurrent;

// Smart cache
pub mod cache;

// Memory pool
pub mod memory;

// Crate-wide error taxonomy
pub mod error;

// Runtime configuration
pub mod config;

// Task executor
pub mod executor;

// Parallel operations engine
pub mod ops;

// Scheduler family
pub mod scheduler;

// Virtual-thread executor
pub mod vthread;

// Distributed execution layer
pub mod cluster;

// Fault-tolerance primitives
pub mod fault;

// Re-export commonly used types
pub use cache::{CacheStats, EvictionPolicy, SmartCache};
pub use concurrent::{AtomicCounter, MpmcQueue, RwDict, ShardedMap};
pub use error::{TaskError, TaskResult};
pub use executor::{Executor, TaskFuture};
pub use fault::{
    AutoCheckpoint, Checkpoint, CheckpointManager, CircuitBreaker, RetryExecutor, RetryStrategy,
};
pub use memory::MemoryPool;
pub use ops::ParallelEngine;
pub use scheduler::{
    AdaptiveScheduler, PriorityScheduler, RoundRobinScheduler, Scheduler, TaskPriority,
    WorkStealingScheduler,
};
pub use vthread::{VirtualThreadConfig, VirtualThreadExecutor, VirtualThreadStats};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
