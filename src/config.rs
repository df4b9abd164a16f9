//! Runtime configuration
//!
//! Per-component settings are plain structs passed at construction time.
//! A process-wide facade holds the defaults (worker count, chunk size) that
//! the parallel engine falls back to when a caller does not specify them.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Process-wide execution defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of workers for parallel operations. Defaults to the hardware
    /// parallelism reported by the OS.
    pub worker_count: usize,
    /// Chunk size for parallel operations. `None` selects the adaptive
    /// policy based on input size.
    pub chunk_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: default_parallelism(),
            chunk_size: None,
        }
    }
}

/// Hardware parallelism, falling back to 1 if the OS cannot report it.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

static GLOBAL_CONFIG: Lazy<RwLock<RuntimeConfig>> =
    Lazy::new(|| RwLock::new(RuntimeConfig::default()));

/// Get the process-wide default worker count.
pub fn get_worker_count() -> usize {
    GLOBAL_CONFIG.read().worker_count
}

/// Set the process-wide default worker count. Zero is coerced to 1.
pub fn set_worker_count(count: usize) {
    GLOBAL_CONFIG.write().worker_count = count.max(1);
}

/// Get the process-wide default chunk size, if one has been pinned.
pub fn get_chunk_size() -> Option<usize> {
    GLOBAL_CONFIG.read().chunk_size
}

/// Pin the process-wide chunk size. `None` restores adaptive chunking.
pub fn set_chunk_size(size: Option<usize>) {
    GLOBAL_CONFIG.write().chunk_size = size.map(|s| s.max(1));
}

/// Snapshot the current process-wide configuration.
pub fn current() -> RuntimeConfig {
    GLOBAL_CONFIG.read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_worker_count_is_positive() {
        assert!(RuntimeConfig::default().worker_count >= 1);
    }

    // One test mutates the process-wide facade so parallel test threads
    // never race on it.
    #[test]
    fn test_facade_set_get_and_coercion() {
        let before = current();

        set_worker_count(3);
        assert_eq!(get_worker_count(), 3);

        set_chunk_size(Some(128));
        assert_eq!(get_chunk_size(), Some(128));

        set_chunk_size(None);
        assert_eq!(get_chunk_size(), None);

        set_worker_count(0);
        assert_eq!(get_worker_count(), 1);

        // Restore for other tests sharing the process.
        set_worker_count(before.worker_count);
        set_chunk_size(before.chunk_size);
    }
}
