//! Sequentially consistent atomic counter

use std::sync::atomic::{AtomicI64, Ordering};

/// A shared counter with sequentially consistent operations.
///
/// Mutating operations return the updated value, except
/// [`compare_and_swap`](AtomicCounter::compare_and_swap) which returns the
/// previous value so callers can tell whether the swap happened.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicI64,
}

impl AtomicCounter {
    /// Create a counter starting at `initial`.
    pub fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    /// Current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Add one and return the new value.
    pub fn increment(&self) -> i64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Subtract one and return the new value.
    pub fn decrement(&self) -> i64 {
        self.value.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Add `n` and return the new value.
    pub fn add(&self, n: i64) -> i64 {
        self.value.fetch_add(n, Ordering::SeqCst) + n
    }

    /// Subtract `n` and return the new value.
    pub fn sub(&self, n: i64) -> i64 {
        self.value.fetch_sub(n, Ordering::SeqCst) - n
    }

    /// If the value equals `expected`, set it to `new`. Returns the value
    /// observed before the operation; the swap happened iff that equals
    /// `expected`.
    pub fn compare_and_swap(&self, expected: i64, new: i64) -> i64 {
        match self
            .value
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(previous) => previous,
            Err(actual) => actual,
        }
    }

    /// Reset the counter to zero.
    pub fn reset(&self) {
        self.value.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_basic_arithmetic() {
        let counter = AtomicCounter::new(10);
        assert_eq!(counter.get(), 10);
        assert_eq!(counter.increment(), 11);
        assert_eq!(counter.decrement(), 10);
        assert_eq!(counter.add(5), 15);
        assert_eq!(counter.sub(3), 12);

        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_compare_and_swap() {
        let counter = AtomicCounter::new(12);

        // Successful swap returns the old value.
        assert_eq!(counter.compare_and_swap(12, 20), 12);
        assert_eq!(counter.get(), 20);

        // Failed swap returns the actual value and leaves it unchanged.
        assert_eq!(counter.compare_and_swap(12, 30), 20);
        assert_eq!(counter.get(), 20);
    }

    #[test]
    fn test_concurrent_increments() {
        const THREADS: usize = 10;
        const PER_THREAD: usize = 1000;

        let counter = Arc::new(AtomicCounter::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        counter.increment();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.get(), (THREADS * PER_THREAD) as i64);
    }
}
