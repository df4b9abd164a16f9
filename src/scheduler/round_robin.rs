//! Round-robin scheduler
//!
//! Task `i` is assigned to worker `i mod W` before execution starts. No
//! rebalancing happens afterwards, which makes the dispatch deterministic
//! and cheap at the cost of tolerance for uneven task durations.

use crossbeam::channel;

use super::{collect_slots, result_slots, Scheduler, Task};
use crate::config::default_parallelism;
use crate::error::TaskResult;

/// Scheduler with static round-robin task assignment.
pub struct RoundRobinScheduler {
    workers: usize,
}

impl RoundRobinScheduler {
    /// Create a scheduler with `workers` workers.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Create a scheduler sized to the hardware parallelism.
    pub fn with_default_workers() -> Self {
        Self::new(default_parallelism())
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.workers
    }
}

impl<R> Scheduler<R> for RoundRobinScheduler
where
    R: Send + 'static,
{
    fn execute(&self, tasks: Vec<Task<R>>) -> Vec<TaskResult<R>> {
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }

        let worker_count = self.workers.min(total);
        let slots = result_slots::<R>(total);

        // One bounded-by-construction queue per worker; senders drop after
        // distribution so each worker sees its exact share then exits.
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..worker_count).map(|_| channel::unbounded()).unzip();

        for (index, task) in tasks.into_iter().enumerate() {
            let target = index % worker_count;
            // Send cannot fail: the receivers outlive this loop.
            let _ = senders[target].send((index, task));
        }
        drop(senders);

        std::thread::scope(|scope| {
            for receiver in receivers {
                let slots = &slots;
                scope.spawn(move || {
                    for (index, task) in receiver {
                        *slots[index].lock() = Some(task());
                    }
                });
            }
        });

        collect_slots(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_in_input_order() {
        let scheduler = RoundRobinScheduler::new(3);
        let tasks: Vec<Task<usize>> = (0..20usize)
            .map(|i| Box::new(move || Ok(i + 100)) as Task<usize>)
            .collect();

        let results = scheduler.execute(tasks);
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i + 100);
        }
    }

    #[test]
    fn test_assignment_is_modular() {
        use parking_lot::Mutex;
        use std::sync::Arc;

        let scheduler = RoundRobinScheduler::new(2);
        let seen: Arc<Mutex<Vec<(usize, String)>>> = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<Task<()>> = (0..6)
            .map(|i| {
                let seen = Arc::clone(&seen);
                Box::new(move || {
                    let id = format!("{:?}", std::thread::current().id());
                    seen.lock().push((i, id));
                    Ok(())
                }) as Task<()>
            })
            .collect();

        scheduler.execute(tasks);

        // Even and odd tasks each ran on a single thread.
        let seen = seen.lock();
        let thread_of = |i: usize| {
            seen.iter()
                .find(|(idx, _)| *idx == i)
                .map(|(_, t)| t.clone())
                .unwrap()
        };
        assert_eq!(thread_of(0), thread_of(2));
        assert_eq!(thread_of(2), thread_of(4));
        assert_eq!(thread_of(1), thread_of(3));
        assert_eq!(thread_of(3), thread_of(5));
        assert_ne!(thread_of(0), thread_of(1));
    }

    #[test]
    fn test_more_workers_than_tasks() {
        let scheduler = RoundRobinScheduler::new(16);
        let tasks: Vec<Task<usize>> = (0..3usize)
            .map(|i| Box::new(move || Ok(i)) as Task<usize>)
            .collect();

        let results = scheduler.execute(tasks);
        assert_eq!(results.len(), 3);
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i);
        }
    }

    #[test]
    fn test_empty_batch() {
        let scheduler = RoundRobinScheduler::new(4);
        let results: Vec<TaskResult<()>> = scheduler.execute(Vec::new());
        assert!(results.is_empty());
    }
}
