//! Lock-free MPMC queue
//!
//! A FIFO queue safe for any number of producers and consumers. Push and
//! pop never block; pop returns `None` on empty. Per-queue push/pop streams
//! are linearizable, but strict global FIFO across producers is not
//! promised.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

/// Nonblocking multi-producer multi-consumer FIFO queue.
pub struct MpmcQueue<T> {
    inner: SegQueue<T>,
    len: AtomicUsize,
}

impl<T> MpmcQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: SegQueue::new(),
            len: AtomicUsize::new(0),
        }
    }

    /// Push a value onto the tail. Never blocks.
    pub fn push(&self, value: T) {
        self.inner.push(value);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Pop a value from the head, or `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        let value = self.inner.pop();
        if value.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        value
    }

    /// Approximate number of queued items. The counter is updated after
    /// the underlying operation, so it can lag under concurrency; it is
    /// exact under quiescence.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the queue appears empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Pop and discard everything currently queued.
    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

impl<T> Default for MpmcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
