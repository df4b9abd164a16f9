//! Fixed-size block memory pool
//!
//! Hands out uniformly sized byte blocks, recycling returned blocks through
//! a free list so steady-state allocation does not hit the system
//! allocator. Blocks are owned values: callers return them with
//! [`MemoryPool::deallocate`], there is no drop-based reclamation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{TaskError, TaskResult};

/// Pool statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    /// Size of every block in bytes.
    pub block_size: usize,
    /// Blocks currently handed out.
    pub allocated: usize,
    /// Blocks sitting in the free list.
    pub available: usize,
    /// Optional cap on `allocated + available`.
    pub max_blocks: Option<usize>,
}

struct PoolState {
    free: Vec<Box<[u8]>>,
    allocated: usize,
}

/// A pool of fixed-size byte blocks with a free list.
pub struct MemoryPool {
    block_size: usize,
    max_blocks: Option<usize>,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    /// Create an unbounded pool of `block_size`-byte blocks.
    pub fn new(block_size: usize) -> Self {
        Self::with_capacity(block_size, None)
    }

    /// Create a pool capped at `max_blocks` total blocks.
    pub fn with_capacity(block_size: usize, max_blocks: Option<usize>) -> Self {
        Self {
            block_size: block_size.max(1),
            max_blocks,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                allocated: 0,
            }),
        }
    }

    /// Size of the blocks this pool hands out.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Take a block from the free list, or allocate a fresh one if under
    /// the cap. Recycled blocks are not zeroed.
    pub fn allocate(&self) -> TaskResult<Box<[u8]>> {
        let mut state = self.state.lock();

        if let Some(block) = state.free.pop() {
            state.allocated += 1;
            return Ok(block);
        }

        if let Some(max) = self.max_blocks {
            if state.allocated >= max {
                return Err(TaskError::ResourceExhausted(format!(
                    "memory pool cap of {} blocks reached",
                    max
                )));
            }
        }

        state.allocated += 1;
        Ok(vec![0u8; self.block_size].into_boxed_slice())
    }

    /// Return a block to the free list. Blocks of the wrong size are
    /// dropped rather than pooled.
    pub fn deallocate(&self, block: Box<[u8]>) {
        let mut state = self.state.lock();
        state.allocated = state.allocated.saturating_sub(1);
        if block.len() == self.block_size {
            state.free.push(block);
        }
    }

    /// Drop every block in the free list, releasing its memory.
    pub fn shrink(&self) {
        self.state.lock().free.clear();
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            block_size: self.block_size,
            allocated: state.allocated,
            available: state.free.len(),
            max_blocks: self.max_blocks,
        }
    }
}
