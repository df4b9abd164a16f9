//! Parallel operations engine
//!
//! Order-preserving `map`, `filter`, `reduce`, and `starmap` over owned
//! input vectors. Inputs are partitioned into contiguous chunks sized by
//! the adaptive policy in [`chunking`]; each chunk becomes one task on the
//! executor's worker pool and per-chunk results are concatenated in chunk
//! order.
//!
//! If a run fails with a resource-exhaustion error the engine halves the
//! chunk size and retries once before surfacing the error.

pub mod chunking;

use std::sync::Arc;

use crate::config;
use crate::error::{TaskError, TaskResult};
use crate::executor::Executor;
use chunking::ChunkSizeCache;

/// Parallel execution engine over a fixed worker pool.
pub struct ParallelEngine {
    executor: Executor,
    workers: usize,
    chunk_cache: ChunkSizeCache,
    chunk_size: Option<usize>,
}

impl ParallelEngine {
    /// Create an engine using the process-wide defaults for worker count
    /// and chunk size.
    pub fn new() -> Self {
        let cfg = config::current();
        Self::with_config(cfg.worker_count, cfg.chunk_size)
    }

    /// Create an engine with `workers` workers and adaptive chunking.
    pub fn with_workers(workers: usize) -> Self {
        Self::with_config(workers, None)
    }

    /// Create an engine with an explicit worker count and, optionally, a
    /// pinned chunk size.
    pub fn with_config(workers: usize, chunk_size: Option<usize>) -> Self {
        let workers = workers.max(1);
        Self {
            executor: Executor::new(workers),
            workers,
            chunk_cache: ChunkSizeCache::new(),
            chunk_size,
        }
    }

    /// Number of workers backing this engine.
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Stop the engine's workers. Outstanding chunks finish first.
    pub fn shutdown(&self) {
        self.executor.shutdown(true);
    }

    fn chunk_size_for(&self, len: usize, op_kind: &'static str) -> usize {
        self.chunk_size
            .or_else(config::get_chunk_size)
            .unwrap_or_else(|| self.chunk_cache.get(len, op_kind, self.workers))
            .max(1)
    }

    /// Partition `items` into `chunk`-sized tasks and collect per-chunk
    /// outputs in chunk order.
    fn dispatch<T, R, Job>(
        &self,
        items: &Arc<Vec<T>>,
        chunk: usize,
        job: &Arc<Job>,
    ) -> TaskResult<Vec<Vec<R>>>
    where
        T: Send + Sync + 'static,
        R: Send + 'static,
        Job: Fn(&[T], usize) -> TaskResult<Vec<R>> + Send + Sync + 'static,
    {
        let len = items.len();
        let mut futures = Vec::with_capacity(len / chunk + 1);
        let mut start = 0;
        let mut index = 0;

        while start < len {
            let end = (start + chunk).min(len);
            let items = Arc::clone(items);
            let job = Arc::clone(job);
            futures.push(
                self.executor
                    .submit(move || job(&items[start..end], index))?,
            );
            start = end;
            index += 1;
        }

        futures.into_iter().map(|f| f.result()).collect()
    }

    /// Run `dispatch`, halving the chunk size and retrying once if the
    /// first pass hits resource exhaustion.
    fn dispatch_with_recovery<T, R, Job>(
        &self,
        items: Arc<Vec<T>>,
        chunk: usize,
        job: Arc<Job>,
    ) -> TaskResult<Vec<Vec<R>>>
    where
        T: Send + Sync + 'static,
        R: Send + 'static,
        Job: Fn(&[T], usize) -> TaskResult<Vec<R>> + Send + Sync + 'static,
    {
        match self.dispatch(&items, chunk, &job) {
            Err(TaskError::ResourceExhausted(reason)) if chunk > 1 => {
                log::warn!(
                    "parallel run exhausted resources ({}), retrying with chunk {}",
                    reason,
                    chunk / 2
                );
                self.dispatch(&items, chunk / 2, &job)
            }
            other => other,
        }
    }

    /// Apply a fallible `f` to every item, preserving input order.
    pub fn try_map<T, R, F>(&self, f: F, items: Vec<T>) -> TaskResult<Vec<R>>
    where
        T: Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(&T) -> TaskResult<R> + Send + Sync + 'static,
    {
        let chunk = self.chunk_size_for(items.len(), "map");
        let items = Arc::new(items);
        let job = Arc::new(move |slice: &[T], _: usize| -> TaskResult<Vec<R>> {
            slice.iter().map(&f).collect()
        });

        let per_chunk = self.dispatch_with_recovery(items, chunk, job)?;
        Ok(per_chunk.into_iter().flatten().collect())
    }

    /// Apply `f` to every item, preserving input order.
    pub fn map<T, R, F>(&self, f: F, items: Vec<T>) -> TaskResult<Vec<R>>
    where
        T: Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(&T) -> R + Send + Sync + 'static,
    {
        self.try_map(move |item| Ok(f(item)), items)
    }

    /// Keep the items for which the fallible `predicate` holds, in input
    /// order.
    pub fn try_filter<T, F>(&self, predicate: F, items: Vec<T>) -> TaskResult<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T) -> TaskResult<bool> + Send + Sync + 'static,
    {
        let chunk = self.chunk_size_for(items.len(), "filter");
        let items = Arc::new(items);
        let job = Arc::new(move |slice: &[T], _: usize| -> TaskResult<Vec<T>> {
            let mut kept = Vec::new();
            for item in slice {
                if predicate(item)? {
                    kept.push(item.clone());
                }
            }
            Ok(kept)
        });

        let per_chunk = self.dispatch_with_recovery(items, chunk, job)?;
        Ok(per_chunk.into_iter().flatten().collect())
    }

    /// Keep the items for which `predicate` holds, in input order.
    pub fn filter<T, F>(&self, predicate: F, items: Vec<T>) -> TaskResult<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.try_filter(move |item| Ok(predicate(item)), items)
    }

    /// Reduce with a fallible associative operator. Each chunk folds
    /// locally, then the chunk results fold left-to-right in chunk order;
    /// `init` seeds only the first chunk, so for associative `op` the
    /// result matches a sequential fold.
    pub fn try_reduce<T, F>(&self, op: F, items: Vec<T>, init: Option<T>) -> TaskResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T, T) -> TaskResult<T> + Send + Sync + 'static,
    {
        if items.is_empty() {
            return init.ok_or_else(|| {
                TaskError::TaskFailure("cannot reduce an empty sequence without an initializer".into())
            });
        }

        let chunk = self.chunk_size_for(items.len(), "reduce");
        let items = Arc::new(items);
        let op = Arc::new(op);
        let init = Arc::new(init);

        let fold_op = Arc::clone(&op);
        let job = Arc::new(move |slice: &[T], index: usize| -> TaskResult<Vec<T>> {
            let mut iter = slice.iter().cloned();
            let mut acc = match (index, init.as_ref()) {
                (0, Some(seed)) => seed.clone(),
                _ => iter.next().expect("chunks are non-empty"),
            };
            for item in iter {
                acc = fold_op(acc, item)?;
            }
            Ok(vec![acc])
        });

        let per_chunk = self.dispatch_with_recovery(items, chunk, job)?;
        let mut locals = per_chunk.into_iter().flatten();
        let mut acc = locals.next().expect("at least one chunk");
        for local in locals {
            acc = op(acc, local)?;
        }
        Ok(acc)
    }

    /// Reduce with an associative operator; `init` seeds the first chunk.
    pub fn reduce<T, F>(&self, op: F, items: Vec<T>, init: Option<T>) -> TaskResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        self.try_reduce(move |a, b| Ok(op(a, b)), items, init)
    }

    /// Apply a fallible two-argument `f` to every pair, preserving input
    /// order.
    pub fn try_starmap<A, B, R, F>(&self, f: F, pairs: Vec<(A, B)>) -> TaskResult<Vec<R>>
    where
        A: Send + Sync + 'static,
        B: Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(&A, &B) -> TaskResult<R> + Send + Sync + 'static,
    {
        let chunk = self.chunk_size_for(pairs.len(), "starmap");
        let items = Arc::new(pairs);
        let job = Arc::new(move |slice: &[(A, B)], _: usize| -> TaskResult<Vec<R>> {
            slice.iter().map(|(a, b)| f(a, b)).collect()
        });

        let per_chunk = self.dispatch_with_recovery(items, chunk, job)?;
        Ok(per_chunk.into_iter().flatten().collect())
    }

    /// Apply a two-argument `f` to every pair, preserving input order.
    pub fn starmap<A, B, R, F>(&self, f: F, pairs: Vec<(A, B)>) -> TaskResult<Vec<R>>
    where
        A: Send + Sync + 'static,
        B: Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(&A, &B) -> R + Send + Sync + 'static,
    {
        self.try_starmap(move |a, b| Ok(f(a, b)), pairs)
    }
}

impl Default for ParallelEngine {
    fn default() -> Self {
        Self::new()
    }
}
