//! Priority scheduler
//!
//! Tasks carry a priority in 0..=255 with lower numbers running first;
//! ties run FIFO. All waiting tasks sit in one heap behind a single lock.
//! To bound the wait of low-priority work, the effective priority of every
//! waiting task is decremented one step per aging interval.

use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use super::{collect_slots, result_slots, Scheduler, Task, TaskPriority, DEFAULT_PRIORITY};
use crate::config::default_parallelism;
use crate::error::TaskResult;

/// How often waiting tasks age one priority step.
const DEFAULT_AGE_INTERVAL: Duration = Duration::from_millis(100);

struct Entry<R> {
    effective: TaskPriority,
    seq: usize,
    index: usize,
    task: Task<R>,
}

impl<R> PartialEq for Entry<R> {
    fn eq(&self, other: &Self) -> bool {
        self.effective == other.effective && self.seq == other.seq
    }
}

impl<R> Eq for Entry<R> {}

impl<R> PartialOrd for Entry<R> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<R> Ord for Entry<R> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the smallest
        // (priority, seq) pair surfaces first.
        other
            .effective
            .cmp(&self.effective)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<R> {
    heap: BinaryHeap<Entry<R>>,
    last_age: Instant,
}

/// Scheduler that runs lower-numbered priorities first.
pub struct PriorityScheduler {
    workers: usize,
    age_interval: Duration,
}

impl PriorityScheduler {
    /// Create a scheduler with `workers` workers and the default aging
    /// interval.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            age_interval: DEFAULT_AGE_INTERVAL,
        }
    }

    /// Create a scheduler sized to the hardware parallelism.
    pub fn with_default_workers() -> Self {
        Self::new(default_parallelism())
    }

    /// Override the aging interval.
    pub fn with_age_interval(mut self, interval: Duration) -> Self {
        self.age_interval = interval;
        self
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Execute tasks tagged with explicit priorities; results come back in
    /// input order.
    pub fn execute_with_priorities<R>(
        &self,
        tasks: Vec<(Task<R>, TaskPriority)>,
    ) -> Vec<TaskResult<R>>
    where
        R: Send + 'static,
    {
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }

        let mut heap = BinaryHeap::with_capacity(total);
        for (seq, (task, priority)) in tasks.into_iter().enumerate() {
            heap.push(Entry {
                effective: priority,
                seq,
                index: seq,
                task,
            });
        }

        let state = Mutex::new(QueueState {
            heap,
            last_age: Instant::now(),
        });
        let slots = result_slots::<R>(total);
        let age_interval = self.age_interval;

        std::thread::scope(|scope| {
            for _ in 0..self.workers.min(total) {
                let state = &state;
                let slots = &slots;
                scope.spawn(move || loop {
                    let popped = {
                        let mut guard = state.lock();
                        if guard.last_age.elapsed() >= age_interval {
                            Self::age_waiting(&mut guard);
                        }
                        guard.heap.pop()
                    };

                    // The heap only drains; empty means this batch is done.
                    match popped {
                        Some(Entry { index, task, .. }) => {
                            *slots[index].lock() = Some(task());
                        }
                        None => break,
                    }
                });
            }
        });

        collect_slots(slots)
    }

    /// Decrement the effective priority of every waiting task one step.
    fn age_waiting<R>(state: &mut QueueState<R>) {
        let entries: Vec<Entry<R>> = state.heap.drain().collect();
        state.heap.extend(entries.into_iter().map(|mut entry| {
            entry.effective = entry.effective.saturating_sub(1);
            entry
        }));
        state.last_age = Instant::now();
    }
}

impl<R> Scheduler<R> for PriorityScheduler
where
    R: Send + 'static,
{
    fn execute(&self, tasks: Vec<Task<R>>) -> Vec<TaskResult<R>> {
        self.execute_with_priorities(tasks.into_iter().map(|t| (t, DEFAULT_PRIORITY)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;
    use std::sync::Arc;

    #[test]
    fn test_lower_priority_number_runs_first() {
        let scheduler = PriorityScheduler::new(1);
        let order: Arc<PMutex<Vec<&'static str>>> = Arc::new(PMutex::new(Vec::new()));

        let mk = |label: &'static str, order: &Arc<PMutex<Vec<&'static str>>>| {
            let order = Arc::clone(order);
            Box::new(move || {
                order.lock().push(label);
                Ok(())
            }) as Task<()>
        };

        let tasks = vec![
            (mk("low", &order), 200),
            (mk("high", &order), 0),
            (mk("mid", &order), 100),
        ];

        scheduler.execute_with_priorities(tasks);
        assert_eq!(*order.lock(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_fifo_within_same_priority() {
        let scheduler = PriorityScheduler::new(1);
        let order: Arc<PMutex<Vec<usize>>> = Arc::new(PMutex::new(Vec::new()));

        let tasks: Vec<(Task<()>, TaskPriority)> = (0..5)
            .map(|i| {
                let order = Arc::clone(&order);
                (
                    Box::new(move || {
                        order.lock().push(i);
                        Ok(())
                    }) as Task<()>,
                    50,
                )
            })
            .collect();

        scheduler.execute_with_priorities(tasks);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_results_in_input_order_not_priority_order() {
        let scheduler = PriorityScheduler::new(2);
        let tasks: Vec<(Task<usize>, TaskPriority)> = (0..10usize)
            .map(|i| {
                (
                    Box::new(move || Ok(i)) as Task<usize>,
                    (255 - i) as TaskPriority,
                )
            })
            .collect();

        let results = scheduler.execute_with_priorities(tasks);
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i);
        }
    }

    #[test]
    fn test_default_priority_via_trait() {
        let scheduler = PriorityScheduler::new(2);
        let tasks: Vec<Task<usize>> = (0..8usize)
            .map(|i| Box::new(move || Ok(i + 1)) as Task<usize>)
            .collect();

        let results = scheduler.execute(tasks);
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i + 1);
        }
    }

    #[test]
    fn test_aging_decrements_waiting_priorities() {
        let mut state = QueueState::<()> {
            heap: BinaryHeap::new(),
            last_age: Instant::now(),
        };
        state.heap.push(Entry {
            effective: 10,
            seq: 0,
            index: 0,
            task: Box::new(|| Ok(())),
        });
        state.heap.push(Entry {
            effective: 0,
            seq: 1,
            index: 1,
            task: Box::new(|| Ok(())),
        });

        PriorityScheduler::age_waiting(&mut state);

        let priorities: Vec<u8> = state.heap.drain().map(|e| e.effective).collect();
        assert!(priorities.contains(&9));
        assert!(priorities.contains(&0));
    }
}
