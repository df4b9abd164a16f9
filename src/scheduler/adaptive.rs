//! Adaptive scheduler
//!
//! Starts with a minimum worker set and resizes while a batch runs: grow
//! while throughput keeps improving and work is queued, shrink after
//! sustained idle windows. Resize decisions happen at most once per
//! measurement window, which keeps the pool from oscillating.

use crossbeam::deque::{Injector, Steal};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{collect_slots, result_slots, Scheduler, Task};
use crate::config::default_parallelism;
use crate::error::TaskResult;

/// Tunables for the adaptive policy.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    /// Workers the pool starts with and never drops below.
    pub min_workers: usize,
    /// Hard ceiling on concurrent workers.
    pub max_workers: usize,
    /// Measurement window between resize decisions.
    pub window: Duration,
    /// Grow when window throughput is at least this multiple of the
    /// previous window's.
    pub grow_threshold: f64,
    /// Shrink after this many consecutive windows without a completion.
    pub idle_windows_to_shrink: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: default_parallelism(),
            window: Duration::from_millis(250),
            grow_threshold: 1.10,
            idle_windows_to_shrink: 3,
        }
    }
}

/// Statistics from the most recent batch.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveRunStats {
    /// Tasks executed.
    pub tasks: usize,
    /// Largest number of workers alive at once.
    pub peak_workers: usize,
    /// Grow decisions taken.
    pub grows: usize,
    /// Shrink decisions taken.
    pub shrinks: usize,
}

/// Scheduler that resizes its worker set with observed throughput.
pub struct AdaptiveScheduler {
    config: AdaptiveConfig,
    last_run: Mutex<AdaptiveRunStats>,
}

impl AdaptiveScheduler {
    /// Create a scheduler bounded by `min_workers..=max_workers` with
    /// default tunables.
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        Self::with_config(AdaptiveConfig {
            min_workers: min_workers.max(1),
            max_workers: max_workers.max(min_workers.max(1)),
            ..AdaptiveConfig::default()
        })
    }

    /// Create a scheduler with explicit tunables.
    pub fn with_config(config: AdaptiveConfig) -> Self {
        Self {
            config,
            last_run: Mutex::new(AdaptiveRunStats::default()),
        }
    }

    /// Statistics from the most recent `execute` call.
    pub fn last_run_stats(&self) -> AdaptiveRunStats {
        self.last_run.lock().clone()
    }
}

struct IndexedTask<R> {
    index: usize,
    task: Task<R>,
}

/// Worker body: drain the injector, honoring one shrink request if asked.
fn worker_loop<R>(
    injector: &Injector<IndexedTask<R>>,
    slots: &[Mutex<Option<TaskResult<R>>>],
    completed: &AtomicUsize,
    live: &AtomicUsize,
    shrink_requests: &AtomicUsize,
    total: usize,
) where
    R: Send + 'static,
{
    live.fetch_add(1, Ordering::SeqCst);
    let backoff = Backoff::new();
    loop {
        // Volunteer to honor one outstanding shrink request.
        let pending_shrinks = shrink_requests.load(Ordering::SeqCst);
        if pending_shrinks > 0
            && shrink_requests
                .compare_exchange(
                    pending_shrinks,
                    pending_shrinks - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
        {
            break;
        }

        let stolen = loop {
            match injector.steal() {
                Steal::Success(task) => break Some(task),
                Steal::Retry => continue,
                Steal::Empty => break None,
            }
        };

        match stolen {
            Some(IndexedTask { index, task }) => {
                *slots[index].lock() = Some(task());
                completed.fetch_add(1, Ordering::SeqCst);
                backoff.reset();
            }
            None => {
                if completed.load(Ordering::SeqCst) >= total {
                    break;
                }
                backoff.snooze();
            }
        }
    }
    live.fetch_sub(1, Ordering::SeqCst);
}

impl<R> Scheduler<R> for AdaptiveScheduler
where
    R: Send + 'static,
{
    fn execute(&self, tasks: Vec<Task<R>>) -> Vec<TaskResult<R>> {
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }

        let injector = Injector::new();
        for (index, task) in tasks.into_iter().enumerate() {
            injector.push(IndexedTask { index, task });
        }

        let slots = result_slots::<R>(total);
        let completed = AtomicUsize::new(0);
        let live = AtomicUsize::new(0);
        let shrink_requests = AtomicUsize::new(0);

        let mut stats = AdaptiveRunStats {
            tasks: total,
            ..AdaptiveRunStats::default()
        };

        std::thread::scope(|scope| {
            let initial = self.config.min_workers.min(total.max(1));
            for _ in 0..initial {
                scope.spawn(|| {
                    worker_loop(&injector, &slots, &completed, &live, &shrink_requests, total)
                });
            }
            stats.peak_workers = initial;

            let mut prev_delta = 0usize;
            let mut last_completed = 0usize;
            let mut idle_windows = 0u32;

            loop {
                std::thread::sleep(self.config.window);
                let done = completed.load(Ordering::SeqCst);
                if done >= total {
                    break;
                }

                let delta = done - last_completed;
                last_completed = done;
                let pending = total - done;
                let current = live.load(Ordering::SeqCst);

                // Work remains but every worker has exited (shrinks can
                // overshoot when they race with batch completion): recover.
                if current == 0 {
                    shrink_requests.store(0, Ordering::SeqCst);
                    scope.spawn(|| {
                        worker_loop(&injector, &slots, &completed, &live, &shrink_requests, total)
                    });
                    stats.grows += 1;
                    continue;
                }

                if delta == 0 {
                    idle_windows += 1;
                    if idle_windows >= self.config.idle_windows_to_shrink
                        && current > self.config.min_workers
                        && shrink_requests.load(Ordering::SeqCst) == 0
                    {
                        shrink_requests.fetch_add(1, Ordering::SeqCst);
                        stats.shrinks += 1;
                        idle_windows = 0;
                    }
                } else {
                    idle_windows = 0;
                    let improving = prev_delta == 0
                        || delta as f64 >= prev_delta as f64 * self.config.grow_threshold;
                    if improving && pending > current && current < self.config.max_workers {
                        scope.spawn(|| {
                            worker_loop(
                                &injector,
                                &slots,
                                &completed,
                                &live,
                                &shrink_requests,
                                total,
                            )
                        });
                        stats.grows += 1;
                        stats.peak_workers = stats.peak_workers.max(current + 1);
                    }
                }
                prev_delta = delta;
            }
        });

        *self.last_run.lock() = stats;
        collect_slots(slots)
    }
}
