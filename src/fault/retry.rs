//! Retry executor with configurable backoff
//!
//! Re-runs a fallible operation until it succeeds, the attempt cap is
//! reached, or a non-retryable error surfaces. The retryable set is a list
//! of error kind names so policies survive serialization and config files.

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{TaskError, TaskResult};

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// Every delay equals `initial_delay`.
    Fixed,
    /// Delay grows as `initial_delay * attempt`, capped at `max_delay`.
    Linear,
    /// Delay grows as `initial_delay * multiplier^(attempt-1)`, capped at
    /// `max_delay`.
    Exponential,
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Backoff schedule.
    pub strategy: RetryStrategy,
    /// Base delay.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor for the exponential schedule.
    pub backoff_multiplier: f64,
    /// Error kind names (see [`TaskError::kind`]) that are worth retrying.
    /// Empty means every error is retryable.
    pub retryable_kinds: HashSet<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            retryable_kinds: HashSet::new(),
        }
    }
}

/// Aggregate counters across all `execute` calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryStats {
    /// Operations executed.
    pub operations: u64,
    /// Attempts across all operations.
    pub total_attempts: u64,
    /// Operations that succeeded only after at least one retry.
    pub recovered: u64,
    /// Operations that exhausted their attempts.
    pub exhausted: u64,
}

type RetryCallback = Box<dyn Fn(u32, &TaskError) + Send + Sync>;

/// Executes operations with bounded, classified retries.
pub struct RetryExecutor {
    config: RetryConfig,
    on_retry: Option<RetryCallback>,
    stats: Mutex<RetryStats>,
}

impl RetryExecutor {
    /// Create an executor with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RetryConfig::default())
    }

    /// Create an executor with an explicit configuration.
    pub fn with_config(config: RetryConfig) -> Self {
        Self {
            config: RetryConfig {
                max_attempts: config.max_attempts.max(1),
                ..config
            },
            on_retry: None,
            stats: Mutex::new(RetryStats::default()),
        }
    }

    /// Mark an error kind as retryable.
    pub fn add_retryable_kind(&mut self, kind: impl Into<String>) {
        self.config.retryable_kinds.insert(kind.into());
    }

    /// Install a callback invoked as `(attempt, error)` before each retry.
    pub fn set_retry_callback<F>(&mut self, callback: F)
    where
        F: Fn(u32, &TaskError) + Send + Sync + 'static,
    {
        self.on_retry = Some(Box::new(callback));
    }

    /// The active configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Aggregate statistics.
    pub fn get_stats(&self) -> RetryStats {
        self.stats.lock().clone()
    }

    /// Delay before the retry following attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay;
        let delay = match self.config.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Linear => base.saturating_mul(attempt),
            RetryStrategy::Exponential => {
                let factor = self.config.backoff_multiplier.powi(attempt as i32 - 1);
                base.mul_f64(factor.max(0.0))
            }
        };
        delay.min(self.config.max_delay)
    }

    fn is_retryable(&self, error: &TaskError) -> bool {
        self.config.retryable_kinds.is_empty()
            || self.config.retryable_kinds.contains(error.kind())
    }

    /// Run `operation` with retries. A non-retryable error surfaces
    /// immediately; exhaustion surfaces
    /// [`TaskError::AllRetriesExhausted`] carrying the last error.
    pub fn execute<F, T>(&self, mut operation: F) -> TaskResult<T>
    where
        F: FnMut() -> TaskResult<T>,
    {
        self.stats.lock().operations += 1;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.stats.lock().total_attempts += 1;

            match operation() {
                Ok(value) => {
                    if attempt > 1 {
                        self.stats.lock().recovered += 1;
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !self.is_retryable(&error) {
                        return Err(error);
                    }
                    if attempt >= self.config.max_attempts {
                        self.stats.lock().exhausted += 1;
                        return Err(TaskError::AllRetriesExhausted {
                            attempts: attempt,
                            last: Box::new(error),
                        });
                    }

                    if let Some(callback) = &self.on_retry {
                        callback(attempt, &error);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    log::debug!(
                        "attempt {} failed ({}), retrying in {:?}",
                        attempt,
                        error,
                        delay
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}
