//! Work-stealing scheduler
//!
//! Every worker owns a deque: the owner pushes and pops its own end while
//! idle workers steal from the other end of a randomly chosen victim. A
//! shared injector seeds the deques and absorbs overflow. Idle workers
//! spin down through an exponential backoff before re-polling.

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use crossbeam::utils::Backoff;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{collect_slots, result_slots, Scheduler, Task};
use crate::config::default_parallelism;
use crate::error::TaskResult;

struct IndexedTask<R> {
    index: usize,
    task: Task<R>,
}

/// Scheduler where idle workers steal queued tasks from busy peers.
pub struct WorkStealingScheduler {
    workers: usize,
}

impl WorkStealingScheduler {
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

    fn find_task<R>(
        local: &Worker<IndexedTask<R>>,
        injector: &Injector<IndexedTask<R>>,
        stealers: &[Stealer<IndexedTask<R>>],
        own: usize,
    ) -> Option<IndexedTask<R>> {
        if let Some(task) = local.pop() {
            return Some(task);
        }

        // Refill from the injector first; it holds the bulk of the batch.
        loop {
            match injector.steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }

        // Steal from a uniformly random victim, then sweep the rest.
        if stealers.len() > 1 {
            let start = rand::thread_rng().gen_range(0..stealers.len());
            for offset in 0..stealers.len() {
                let victim = (start + offset) % stealers.len();
                if victim == own {
                    continue;
                }
                loop {
                    match stealers[victim].steal() {
                        Steal::Success(task) => return Some(task),
                        Steal::Retry => continue,
                        Steal::Empty => break,
                    }
                }
            }
        }

        None
    }
}

impl<R> Scheduler<R> for WorkStealingScheduler
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

        let worker_count = self.workers.min(total);
        let locals: Vec<Worker<IndexedTask<R>>> =
            (0..worker_count).map(|_| Worker::new_lifo()).collect();
        let stealers: Vec<Stealer<IndexedTask<R>>> = locals.iter().map(|w| w.stealer()).collect();

        let slots = result_slots::<R>(total);
        let completed = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for (own, local) in locals.into_iter().enumerate() {
                let injector = &injector;
                let stealers = &stealers;
                let slots = &slots;
                let completed = &completed;

                scope.spawn(move || {
                    let backoff = Backoff::new();
                    loop {
                        match Self::find_task(&local, injector, stealers, own) {
                            Some(IndexedTask { index, task }) => {
                                let result = task();
                                *slots[index].lock() = Some(result);
                                completed.fetch_add(1, Ordering::SeqCst);
                                backoff.reset();
                            }
                            None => {
                                if completed.load(Ordering::SeqCst) >= total {
                                    break;
                                }
                                // Park briefly with exponential backoff
                                // before re-polling the empty queues.
                                backoff.snooze();
                            }
                        }
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
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn boxed_tasks(n: usize) -> Vec<Task<usize>> {
        (0..n)
            .map(|i| Box::new(move || Ok(i * 2)) as Task<usize>)
            .collect()
    }

    #[test]
    fn test_results_in_input_order() {
        let scheduler = WorkStealingScheduler::new(4);
        let results = scheduler.execute(boxed_tasks(100));

        assert_eq!(results.len(), 100);
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i * 2);
        }
    }

    #[test]
    fn test_empty_batch() {
        let scheduler = WorkStealingScheduler::new(4);
        let results: Vec<TaskResult<usize>> = scheduler.execute(Vec::new());
        assert!(results.is_empty());
    }

    #[test]
    fn test_uneven_task_durations_all_complete() {
        let scheduler = WorkStealingScheduler::new(4);
        let ran = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Task<usize>> = (0..32usize)
            .map(|i| {
                let ran = Arc::clone(&ran);
                Box::new(move || {
                    if i % 8 == 0 {
                        std::thread::sleep(std::time::Duration::from_millis(10));
                    }
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(i)
                }) as Task<usize>
            })
            .collect();

        let results = scheduler.execute(tasks);
        assert_eq!(ran.load(Ordering::SeqCst), 32);
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i);
        }
    }

    #[test]
    fn test_failed_task_keeps_slot() {
        use crate::error::TaskError;

        let scheduler = WorkStealingScheduler::new(2);
        let tasks: Vec<Task<usize>> = vec![
            Box::new(|| Ok(1)),
            Box::new(|| Err(TaskError::TaskFailure("bad".into()))),
            Box::new(|| Ok(3)),
        ];

        let results = scheduler.execute(tasks);
        assert_eq!(results[0].as_ref().unwrap(), &1);
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), &3);
    }

    #[test]
    fn test_single_worker_degenerates_to_sequential() {
        let scheduler = WorkStealingScheduler::new(1);
        let results = scheduler.execute(boxed_tasks(10));
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i * 2);
        }
    }
}
