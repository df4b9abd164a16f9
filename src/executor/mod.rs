//! Task executor
//!
//! Owns a fixed worker pool and a submission queue. `submit` returns a
//! [`TaskFuture`] immediately; `map` blocks and preserves input order. One
//! failing task never affects its siblings: errors surface only on that
//! task's future.

pub mod pool;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config;
use crate::error::{TaskError, TaskResult};
use pool::ThreadPool;

enum FutureSlot<T> {
    Pending,
    Ready(TaskResult<T>),
}

struct FutureShared<T> {
    slot: Mutex<FutureSlot<T>>,
    cond: Condvar,
}

/// Handle to the eventual result of a submitted task.
pub struct TaskFuture<T> {
    shared: Arc<FutureShared<T>>,
}

impl<T> std::fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture").finish_non_exhaustive()
    }
}

impl<T> TaskFuture<T> {
    fn pending() -> (Self, Arc<FutureShared<T>>) {
        let shared = Arc::new(FutureShared {
            slot: Mutex::new(FutureSlot::Pending),
            cond: Condvar::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            shared,
        )
    }

    /// Whether the task has reached a terminal state.
    pub fn is_done(&self) -> bool {
        matches!(*self.shared.slot.lock(), FutureSlot::Ready(_))
    }

    /// Block until the task terminates and return its result.
    pub fn result(self) -> TaskResult<T> {
        let mut slot = self.shared.slot.lock();
        while matches!(*slot, FutureSlot::Pending) {
            self.shared.cond.wait(&mut slot);
        }
        match std::mem::replace(&mut *slot, FutureSlot::Pending) {
            FutureSlot::Ready(result) => result,
            FutureSlot::Pending => unreachable!("future woken without a result"),
        }
    }

    /// Block up to `timeout` for the result. On expiry the future is
    /// consumed and [`TaskError::Timeout`] is returned; the task itself
    /// keeps running to completion.
    pub fn result_timeout(self, timeout: Duration) -> TaskResult<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        while matches!(*slot, FutureSlot::Pending) {
            if self
                .shared
                .cond
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                return Err(TaskError::Timeout("task future".into()));
            }
        }
        match std::mem::replace(&mut *slot, FutureSlot::Pending) {
            FutureSlot::Ready(result) => result,
            FutureSlot::Pending => unreachable!("future woken without a result"),
        }
    }
}

fn fulfill<T>(shared: &FutureShared<T>, result: TaskResult<T>) {
    *shared.slot.lock() = FutureSlot::Ready(result);
    shared.cond.notify_all();
}

/// Thread-pool backed task executor.
pub struct Executor {
    pool: ThreadPool,
}

impl Executor {
    /// Create an executor with `max_workers` worker threads.
    pub fn new(max_workers: usize) -> Self {
        Self {
            pool: ThreadPool::new(max_workers),
        }
    }

    /// Create an executor sized to the process-wide default worker count.
    pub fn with_default_workers() -> Self {
        Self::new(config::get_worker_count())
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    /// Whether the executor still accepts submissions.
    pub fn is_active(&self) -> bool {
        self.pool.is_active()
    }

    /// Submit a fallible task. The returned future resolves to the task's
    /// result; a task error never disturbs other tasks.
    pub fn submit<F, T>(&self, task: F) -> TaskResult<TaskFuture<T>>
    where
        F: FnOnce() -> TaskResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (future, shared) = TaskFuture::pending();

        let accepted = self.pool.execute(move || {
            let result = task();
            fulfill(&shared, result);
        });

        if accepted {
            Ok(future)
        } else {
            Err(TaskError::Shutdown)
        }
    }

    /// Submit an infallible task.
    pub fn spawn<F, T>(&self, task: F) -> TaskResult<TaskFuture<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.submit(move || Ok(task()))
    }

    /// Apply `f` to every item, blocking until all complete. Results come
    /// back in input order. If any task failed, the first failure (in
    /// input order) is returned after all tasks have finished.
    pub fn map<F, T, R, I>(&self, f: F, items: I) -> TaskResult<Vec<R>>
    where
        F: Fn(T) -> TaskResult<R> + Send + Sync + 'static,
        T: Send + 'static,
        R: Send + 'static,
        I: IntoIterator<Item = T>,
    {
        let f = Arc::new(f);
        let futures: Vec<TaskFuture<R>> = items
            .into_iter()
            .map(|item| {
                let f = Arc::clone(&f);
                self.submit(move || f(item))
            })
            .collect::<TaskResult<_>>()?;

        let mut results = Vec::with_capacity(futures.len());
        let mut first_err = None;
        for future in futures {
            match future.result() {
                Ok(value) => results.push(value),
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    /// Stop accepting submissions. Already-accepted tasks run to
    /// completion; with `wait` the call blocks until they have. Idempotent.
    pub fn shutdown(&self, wait: bool) {
        self.pool.shutdown(wait);
    }
}
