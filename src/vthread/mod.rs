//! Virtual-thread executor
//!
//! Multiplexes a large number of lightweight tasks over a bounded pool of
//! platform threads. Cooperative tasks wait in a global priority queue;
//! each platform thread refills a small local run queue from it and runs
//! the batch in priority order. Tasks flagged as blocking are segregated
//! onto a separate pool so they can never occupy cooperative threads.
//!
//! Tasks cannot be cancelled once started; `join` blocks until the task
//! terminates and surfaces its result or captured error.

use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::config::default_parallelism;
use crate::error::{TaskError, TaskResult};
use crate::scheduler::{TaskPriority, DEFAULT_PRIORITY};

/// Default cap on concurrently live virtual tasks.
pub const DEFAULT_MAX_VIRTUAL_THREADS: usize = 1_000_000;

/// Tasks a platform thread pulls into its local run queue per refill.
const LOCAL_BATCH: usize = 8;

/// Identifier of a submitted virtual task.
pub type VirtualTaskId = u64;

/// Observable lifecycle state of a virtual task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VirtualTaskState {
    /// Queued on the cooperative queue, ready to run.
    Runnable,
    /// Queued on the blocking pool, waiting for a blocking slot.
    Blocked,
    /// Currently executing on a platform thread.
    Running,
    /// Finished; the result waits for `join`.
    Terminated,
}

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualThreadConfig {
    /// Cap on concurrently live (submitted, not yet joined-off) tasks.
    pub max_virtual_threads: usize,
    /// Platform threads running cooperative tasks. The blocking pool gets
    /// the same number of threads of its own.
    pub max_platform_threads: usize,
}

impl Default for VirtualThreadConfig {
    fn default() -> Self {
        Self {
            max_virtual_threads: DEFAULT_MAX_VIRTUAL_THREADS,
            max_platform_threads: default_parallelism(),
        }
    }
}

/// Executor statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualThreadStats {
    /// Tasks ever submitted.
    pub total_created: u64,
    /// Tasks submitted but not yet terminated.
    pub active: u64,
    /// Tasks that reached a terminal state.
    pub completed: u64,
    /// Cooperative platform threads.
    pub platform_threads: usize,
    /// Whether the executor accepts submissions.
    pub is_running: bool,
}

type BoxedResult = TaskResult<Box<dyn Any + Send>>;
type TaskFn = Box<dyn FnOnce() -> BoxedResult + Send>;

enum RecordState {
    Queued(VirtualTaskState),
    Running,
    Done(BoxedResult),
    Taken,
}

struct TaskRecord {
    state: Mutex<RecordState>,
    cond: Condvar,
}

struct QueuedTask {
    id: VirtualTaskId,
    priority: TaskPriority,
    seq: u64,
    func: TaskFn,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: reverse so the lowest (priority, seq) runs first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    cooperative: Mutex<BinaryHeap<QueuedTask>>,
    cooperative_cond: Condvar,
    blocking: Mutex<VecDeque<QueuedTask>>,
    blocking_cond: Condvar,
    registry: DashMap<VirtualTaskId, Arc<TaskRecord>>,
    accepting: AtomicBool,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    created: AtomicU64,
    completed: AtomicU64,
}

impl Inner {
    fn run_task(&self, task: QueuedTask) {
        let record = match self.registry.get(&task.id) {
            Some(record) => Arc::clone(&record),
            None => return,
        };

        *record.state.lock() = RecordState::Running;
        let result = (task.func)();

        *record.state.lock() = RecordState::Done(result);
        record.cond.notify_all();
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Cooperative worker: refill a local run queue from the priority
    /// heap, run the batch, repeat until shutdown drains the queue.
    fn cooperative_loop(&self) {
        loop {
            let mut local: Vec<QueuedTask> = Vec::with_capacity(LOCAL_BATCH);
            {
                let mut queue = self.cooperative.lock();
                loop {
                    while local.len() < LOCAL_BATCH {
                        match queue.pop() {
                            Some(task) => local.push(task),
                            None => break,
                        }
                    }
                    if !local.is_empty() {
                        break;
                    }
                    if !self.accepting.load(Ordering::SeqCst) {
                        return;
                    }
                    self.cooperative_cond.wait(&mut queue);
                }
            }

            for task in local {
                self.run_task(task);
            }
        }
    }

    /// Blocking worker: plain FIFO, one task at a time.
    fn blocking_loop(&self) {
        loop {
            let task = {
                let mut queue = self.blocking.lock();
                loop {
                    if let Some(task) = queue.pop_front() {
                        break task;
                    }
                    if !self.accepting.load(Ordering::SeqCst) {
                        return;
                    }
                    self.blocking_cond.wait(&mut queue);
                }
            };
            self.run_task(task);
        }
    }
}

/// Cooperative lightweight-task executor over a bounded thread pool.
pub struct VirtualThreadExecutor {
    config: VirtualThreadConfig,
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl VirtualThreadExecutor {
    /// Create an executor with the default configuration. Call
    /// [`start`](Self::start) before submitting.
    pub fn new() -> Self {
        Self::with_config(VirtualThreadConfig::default())
    }

    /// Create an executor with explicit limits.
    pub fn with_config(config: VirtualThreadConfig) -> Self {
        let config = VirtualThreadConfig {
            max_virtual_threads: config.max_virtual_threads.max(1),
            max_platform_threads: config.max_platform_threads.max(1),
        };
        Self {
            config,
            inner: Arc::new(Inner {
                cooperative: Mutex::new(BinaryHeap::new()),
                cooperative_cond: Condvar::new(),
                blocking: Mutex::new(VecDeque::new()),
                blocking_cond: Condvar::new(),
                registry: DashMap::new(),
                accepting: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                next_seq: AtomicU64::new(0),
                created: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            }),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the platform threads and begin accepting tasks. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.accepting.store(true, Ordering::SeqCst);

        let mut handles = self.handles.lock();
        for i in 0..self.config.max_platform_threads {
            let inner = Arc::clone(&self.inner);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("ferrox-vt-{}", i))
                    .spawn(move || inner.cooperative_loop())
                    .expect("failed to spawn platform thread"),
            );
        }
        for i in 0..self.config.max_platform_threads {
            let inner = Arc::clone(&self.inner);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("ferrox-vt-blocking-{}", i))
                    .spawn(move || inner.blocking_loop())
                    .expect("failed to spawn blocking thread"),
            );
        }

        log::debug!(
            "virtual-thread executor started with {} platform threads",
            self.config.max_platform_threads
        );
    }

    /// Whether the executor accepts submissions.
    pub fn is_running(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Submit a fallible task. Returns its id for a later
    /// [`join`](Self::join).
    pub fn submit<F, T>(
        &self,
        task: F,
        priority: TaskPriority,
        is_blocking: bool,
    ) -> TaskResult<VirtualTaskId>
    where
        F: FnOnce() -> TaskResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(TaskError::Shutdown);
        }

        // Read completed first so the difference can never underflow.
        let completed = self.inner.completed.load(Ordering::SeqCst);
        let live = self.inner.created.load(Ordering::SeqCst).saturating_sub(completed);
        if live as usize >= self.config.max_virtual_threads {
            return Err(TaskError::ResourceExhausted(format!(
                "virtual task cap of {} reached",
                self.config.max_virtual_threads
            )));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let queued_state = if is_blocking {
            VirtualTaskState::Blocked
        } else {
            VirtualTaskState::Runnable
        };

        self.inner.registry.insert(
            id,
            Arc::new(TaskRecord {
                state: Mutex::new(RecordState::Queued(queued_state)),
                cond: Condvar::new(),
            }),
        );
        self.inner.created.fetch_add(1, Ordering::SeqCst);

        let func: TaskFn = Box::new(move || task().map(|v| Box::new(v) as Box<dyn Any + Send>));
        let queued = QueuedTask {
            id,
            priority,
            seq,
            func,
        };

        if is_blocking {
            self.inner.blocking.lock().push_back(queued);
            self.inner.blocking_cond.notify_one();
        } else {
            self.inner.cooperative.lock().push(queued);
            self.inner.cooperative_cond.notify_one();
        }

        Ok(id)
    }

    /// Submit an infallible task at the default priority.
    pub fn spawn<F, T>(&self, task: F) -> TaskResult<VirtualTaskId>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.submit(move || Ok(task()), DEFAULT_PRIORITY, false)
    }

    /// Block until the task terminates; surfaces its boxed result or
    /// re-raises the captured error. Each task can be joined once.
    pub fn join(&self, id: VirtualTaskId) -> TaskResult<Box<dyn Any + Send>> {
        let record = match self.inner.registry.get(&id) {
            Some(record) => Arc::clone(&record),
            None => {
                return Err(TaskError::TaskFailure(format!(
                    "unknown virtual task {}",
                    id
                )))
            }
        };

        let mut state = record.state.lock();
        loop {
            match &*state {
                RecordState::Done(_) => break,
                RecordState::Taken => {
                    return Err(TaskError::TaskFailure(format!(
                        "virtual task {} already joined",
                        id
                    )))
                }
                _ => record.cond.wait(&mut state),
            }
        }

        let result = match std::mem::replace(&mut *state, RecordState::Taken) {
            RecordState::Done(result) => result,
            _ => unreachable!("loop exits only on Done"),
        };
        drop(state);

        self.inner.registry.remove(&id);
        result
    }

    /// Join and downcast the result to `T`.
    pub fn join_as<T>(&self, id: VirtualTaskId) -> TaskResult<T>
    where
        T: Send + 'static,
    {
        let boxed = self.join(id)?;
        boxed.downcast::<T>().map(|b| *b).map_err(|_| {
            TaskError::TaskFailure(format!("virtual task {} result has a different type", id))
        })
    }

    /// Observable state of a task, or `None` once joined off.
    pub fn task_state(&self, id: VirtualTaskId) -> Option<VirtualTaskState> {
        let record = self.inner.registry.get(&id)?;
        let state = record.state.lock();
        Some(match &*state {
            RecordState::Queued(queued) => *queued,
            RecordState::Running => VirtualTaskState::Running,
            RecordState::Done(_) | RecordState::Taken => VirtualTaskState::Terminated,
        })
    }

    /// Statistics snapshot.
    pub fn get_stats(&self) -> VirtualThreadStats {
        let completed = self.inner.completed.load(Ordering::SeqCst);
        let created = self.inner.created.load(Ordering::SeqCst);
        VirtualThreadStats {
            total_created: created,
            active: created.saturating_sub(completed),
            completed,
            platform_threads: self.config.max_platform_threads,
            is_running: self.is_running(),
        }
    }

    /// Stop accepting tasks, drain everything already queued, and join the
    /// platform threads. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.cooperative_cond.notify_all();
        self.inner.blocking_cond.notify_all();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        log::debug!("virtual-thread executor shut down");
    }
}

impl Default for VirtualThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VirtualThreadExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
