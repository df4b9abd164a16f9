//! Task schedulers
//!
//! Four dispatch policies behind one contract: a scheduler accepts a batch
//! of tasks and returns their results in input order.
//!
//! - [`WorkStealingScheduler`]: per-worker deques, idle workers steal
//! - [`RoundRobinScheduler`]: task `i` goes to worker `i mod W`
//! - [`AdaptiveScheduler`]: grows and shrinks its worker set with load
//! - [`PriorityScheduler`]: lowest priority number first, FIFO within a
//!   priority, with aging so low-priority tasks cannot starve

pub mod adaptive;
pub mod priority;
pub mod round_robin;
pub mod work_stealing;

pub use adaptive::{AdaptiveConfig, AdaptiveScheduler};
pub use priority::PriorityScheduler;
pub use round_robin::RoundRobinScheduler;
pub use work_stealing::WorkStealingScheduler;

use crate::error::TaskResult;

/// A unit of schedulable work producing an `R`.
pub type Task<R> = Box<dyn FnOnce() -> TaskResult<R> + Send + 'static>;

/// Task priority: 0..=255, lower numbers run first.
pub type TaskPriority = u8;

/// Default priority for tasks submitted without one.
pub const DEFAULT_PRIORITY: TaskPriority = 128;

/// Common scheduler contract: execute a batch, return results in input
/// order. A failed task occupies its slot with the task's error; sibling
/// tasks are unaffected.
pub trait Scheduler<R>
where
    R: Send + 'static,
{
    /// Execute every task and collect per-task results in input order.
    fn execute(&self, tasks: Vec<Task<R>>) -> Vec<TaskResult<R>>;
}

/// Shared slot vector the workers write results into, indexed by task.
pub(crate) fn result_slots<R>(len: usize) -> Vec<parking_lot::Mutex<Option<TaskResult<R>>>> {
    (0..len).map(|_| parking_lot::Mutex::new(None)).collect()
}

/// Drain filled slots into the ordered result vector.
pub(crate) fn collect_slots<R>(
    slots: Vec<parking_lot::Mutex<Option<TaskResult<R>>>>,
) -> Vec<TaskResult<R>> {
    slots
        .into_iter()
        .map(|slot| {
            slot.into_inner()
                .expect("scheduler finished with an unfilled result slot")
        })
        .collect()
}
