//! # Worker Allocators
//!
//! A `WorkerAllocator` owns a fixed set of workers and hands them out one
//! caller at a time. Two policies are provided:
//!
//! - [`FixedPoolWorkerAllocator`]: N interchangeable workers. Shareable by
//!   default, so many tasks may allocate concurrently; the exclusive variant is
//!   for sources that bind one worker per partition for the partition's lifetime.
//! - [`SingletonWorkerAllocator`]: exactly one worker, for inherently
//!   single-threaded sources.
//!
//! Callers should go through [`WorkerLease`], which releases the worker when
//! dropped so the pool can never leak capacity on an error or panic path.

use async_trait::async_trait;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::Worker;
use crate::error::Result;
use crate::pool::BoundedPool;

#[async_trait]
pub trait WorkerAllocator: Send + Sync + std::fmt::Debug {
    /// Take a worker out of the pool.
    ///
    /// `None` blocks until one is free, `Some(Duration::ZERO)` fails at once
    /// when the pool is exhausted, any other value waits at most that long.
    async fn allocate(&self, timeout: Option<Duration>) -> Result<Arc<Worker>>;

    /// Return a worker obtained from `allocate`
    fn release(&self, worker: Arc<Worker>);

    /// Whether concurrent callers may interleave allocate/release
    fn shareable(&self) -> bool;

    /// Every worker owned by the allocator, allocated or not
    fn workers(&self) -> Vec<Arc<Worker>>;

    fn capacity(&self) -> usize;
}

#[derive(Debug)]
pub struct FixedPoolWorkerAllocator {
    pool: BoundedPool<Arc<Worker>>,
    workers: Vec<Arc<Worker>>,
    shareable: bool,
}

impl FixedPoolWorkerAllocator {
    /// Shareable pool over the given workers
    pub fn new(workers: Vec<Arc<Worker>>) -> Self {
        Self::with_shareable(workers, true)
    }

    /// Non-shareable pool over the given workers
    pub fn exclusive(workers: Vec<Arc<Worker>>) -> Self {
        Self::with_shareable(workers, false)
    }

    fn with_shareable(workers: Vec<Arc<Worker>>, shareable: bool) -> Self {
        debug!(
            num_workers = workers.len(),
            shareable = shareable,
            "Creating fixed pool worker allocator"
        );

        Self {
            pool: BoundedPool::new("workers", workers.clone()),
            workers,
            shareable,
        }
    }

    pub fn available(&self) -> usize {
        self.pool.available()
    }
}

#[async_trait]
impl WorkerAllocator for FixedPoolWorkerAllocator {
    async fn allocate(&self, timeout: Option<Duration>) -> Result<Arc<Worker>> {
        let worker = self.pool.acquire(timeout).await?;
        trace!(worker = worker.index(), "Allocated worker");
        Ok(worker)
    }

    fn release(&self, worker: Arc<Worker>) {
        trace!(worker = worker.index(), "Releasing worker");
        self.pool
            .release_unless_idle(worker, |idle, released| Arc::ptr_eq(idle, released));
    }

    fn shareable(&self) -> bool {
        self.shareable
    }

    fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers.clone()
    }

    fn capacity(&self) -> usize {
        self.pool.capacity()
    }
}

#[derive(Debug)]
pub struct SingletonWorkerAllocator {
    pool: BoundedPool<Arc<Worker>>,
    worker: Arc<Worker>,
}

impl SingletonWorkerAllocator {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self {
            pool: BoundedPool::new("singleton", vec![worker.clone()]),
            worker,
        }
    }
}

#[async_trait]
impl WorkerAllocator for SingletonWorkerAllocator {
    async fn allocate(&self, timeout: Option<Duration>) -> Result<Arc<Worker>> {
        self.pool.acquire(timeout).await
    }

    fn release(&self, worker: Arc<Worker>) {
        self.pool
            .release_unless_idle(worker, |idle, released| Arc::ptr_eq(idle, released));
    }

    fn shareable(&self) -> bool {
        false
    }

    fn workers(&self) -> Vec<Arc<Worker>> {
        vec![self.worker.clone()]
    }

    fn capacity(&self) -> usize {
        1
    }
}

/// A worker held on behalf of one caller, released back on drop
#[derive(Debug)]
pub struct WorkerLease {
    allocator: Arc<dyn WorkerAllocator>,
    worker: Arc<Worker>,
}

impl WorkerLease {
    pub async fn acquire(
        allocator: &Arc<dyn WorkerAllocator>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let worker = allocator.allocate(timeout).await?;
        Ok(Self {
            allocator: Arc::clone(allocator),
            worker,
        })
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }
}

impl Deref for WorkerLease {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        &self.worker
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.allocator.release(Arc::clone(&self.worker));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::runtime::EchoRuntime;

    fn workers(count: usize) -> Vec<Arc<Worker>> {
        (0..count)
            .map(|index| Arc::new(Worker::new(index, Arc::new(EchoRuntime))))
            .collect()
    }

    #[tokio::test]
    async fn test_fixed_pool_hands_out_distinct_workers() {
        let allocator = FixedPoolWorkerAllocator::new(workers(2));
        assert!(allocator.shareable());
        assert_eq!(allocator.capacity(), 2);

        let first = allocator.allocate(None).await.unwrap();
        let second = allocator.allocate(None).await.unwrap();
        assert_ne!(first.index(), second.index());

        let err = allocator.allocate(Some(Duration::ZERO)).await.unwrap_err();
        assert_eq!(err, DispatchError::NoAvailableWorkers);

        allocator.release(first);
        allocator.release(second);
        assert_eq!(allocator.available(), 2);
    }

    #[tokio::test]
    async fn test_exclusive_pool_is_not_shareable() {
        let allocator = FixedPoolWorkerAllocator::exclusive(workers(3));
        assert!(!allocator.shareable());
        assert_eq!(allocator.workers().len(), 3);
    }

    #[tokio::test]
    async fn test_singleton() {
        let allocator = SingletonWorkerAllocator::new(workers(1).remove(0));
        assert!(!allocator.shareable());
        assert_eq!(allocator.capacity(), 1);

        let worker = allocator.allocate(None).await.unwrap();
        assert!(allocator
            .allocate(Some(Duration::from_millis(5)))
            .await
            .is_err());

        allocator.release(worker);
        assert!(allocator.allocate(Some(Duration::ZERO)).await.is_ok());
    }

    #[tokio::test]
    async fn test_double_release_never_hands_out_a_worker_twice() {
        let allocator = FixedPoolWorkerAllocator::new(workers(2));
        let first = allocator.allocate(None).await.unwrap();
        let second = allocator.allocate(None).await.unwrap();

        allocator.release(first.clone());
        allocator.release(first);
        assert_eq!(allocator.available(), 1);

        let again = allocator.allocate(Some(Duration::ZERO)).await.unwrap();
        assert!(allocator.allocate(Some(Duration::ZERO)).await.is_err());
        assert!(!Arc::ptr_eq(&again, &second));

        allocator.release(again);
        allocator.release(second);
        assert_eq!(allocator.available(), 2);
    }

    #[tokio::test]
    async fn test_lease_releases_on_drop() {
        let allocator: Arc<dyn WorkerAllocator> =
            Arc::new(FixedPoolWorkerAllocator::new(workers(1)));

        {
            let lease = WorkerLease::acquire(&allocator, None).await.unwrap();
            assert_eq!(lease.index(), 0);
            assert!(allocator.allocate(Some(Duration::ZERO)).await.is_err());
        }

        let worker = allocator.allocate(Some(Duration::ZERO)).await.unwrap();
        allocator.release(worker);
    }
}
