//! Concurrent data structures
//!
//! This module provides the shared-state primitives used by the executors
//! and schedulers:
//! - Sharded hash map with per-shard locking
//! - Lock-free MPMC queue
//! - Sequentially consistent atomic counter
//! - Read-mostly locked dictionary

pub mod counter;
pub mod map;
pub mod queue;
pub mod rwdict;

pub use counter::AtomicCounter;
pub use map::ShardedMap;
pub use queue::MpmcQueue;
pub use rwdict::RwDict;
