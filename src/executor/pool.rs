//! Fixed-size OS-thread worker pool
//!
//! Workers drain a shared unbounded channel. Dropping the sender side is
//! the shutdown signal: workers finish everything already queued and then
//! exit, so a graceful shutdown never abandons accepted work.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A pool of worker threads executing boxed jobs from a shared queue.
pub struct ThreadPool {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl ThreadPool {
    /// Spawn `size` worker threads (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = channel::unbounded::<Job>();

        let handles = (0..size)
            .map(|i| {
                let receiver: Receiver<Job> = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("ferrox-worker-{}", i))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            size,
        }
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job. Returns false if the pool has been shut down.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Whether the pool still accepts jobs.
    pub fn is_active(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Stop accepting jobs. Already-queued jobs still run; if `wait` is
    /// set, block until the workers have drained and exited. Idempotent.
    pub fn shutdown(&self, wait: bool) {
        drop(self.sender.lock().take());

        if wait {
            let handles: Vec<_> = self.handles.lock().drain(..).collect();
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_run() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            assert!(pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.shutdown(true);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_shutdown_rejects_new_jobs() {
        let pool = ThreadPool::new(2);
        pool.shutdown(true);

        assert!(!pool.is_active());
        assert!(!pool.execute(|| {}));
    }

    #[test]
    fn test_shutdown_idempotent() {
        let pool = ThreadPool::new(2);
        pool.shutdown(true);
        pool.shutdown(true);
        assert!(!pool.is_active());
    }

    #[test]
    fn test_queued_jobs_finish_on_graceful_shutdown() {
        let pool = ThreadPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.shutdown(true);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
