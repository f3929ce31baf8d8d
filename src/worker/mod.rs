//! # Workers
//!
//! A worker is an execution context able to run one function invocation at a
//! time. Workers are created up front by a [`WorkerFactory`] and circulate
//! through a [`WorkerAllocator`]; whoever holds one has it exclusively until it
//! is released.

pub mod allocator;

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::event::Event;
use crate::runtime::{ProcessError, ProcessResult, Runtime, RuntimeFactory};
use crate::statistics::{WorkerStatistics, WorkerStatisticsSnapshot};

pub use allocator::{
    FixedPoolWorkerAllocator, SingletonWorkerAllocator, WorkerAllocator, WorkerLease,
};

pub struct Worker {
    index: usize,
    runtime: Arc<dyn Runtime>,
    statistics: WorkerStatistics,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("statistics", &self.statistics.snapshot())
            .finish()
    }
}

impl Worker {
    pub fn new(index: usize, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            index,
            runtime,
            statistics: WorkerStatistics::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Run the function on one event. A panic inside the runtime is reported
    /// as a `ProcessError`.
    pub async fn process_event(&self, event: &Event) -> ProcessResult {
        let started = Instant::now();

        let result = AssertUnwindSafe(self.runtime.process_event(event))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!(
                    worker = self.index,
                    event_id = %event.id,
                    panic = %message,
                    "Function panicked while processing event"
                );
                Err(ProcessError::new(format!("Function panicked: {message}")))
            });

        self.statistics.record(result.is_ok(), started.elapsed());
        result
    }

    pub fn statistics(&self) -> WorkerStatisticsSnapshot {
        self.statistics.snapshot()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Creates workers, each with its own runtime instance
#[derive(Clone)]
pub struct WorkerFactory {
    runtime_factory: Arc<dyn RuntimeFactory>,
    runtime_config: RuntimeConfig,
}

impl WorkerFactory {
    pub fn new(runtime_factory: Arc<dyn RuntimeFactory>, runtime_config: RuntimeConfig) -> Self {
        Self {
            runtime_factory,
            runtime_config,
        }
    }

    pub fn create_workers(&self, count: usize) -> Result<Vec<Arc<Worker>>> {
        debug!(
            count = count,
            runtime = %self.runtime_config.kind,
            "Creating workers"
        );

        (0..count)
            .map(|index| {
                let runtime = self.runtime_factory.create(&self.runtime_config, index)?;
                Ok(Arc::new(Worker::new(index, runtime)))
            })
            .collect()
    }

    /// Shareable pool of `count` interchangeable workers
    pub fn create_fixed_pool(&self, count: usize) -> Result<Arc<dyn WorkerAllocator>> {
        Ok(Arc::new(FixedPoolWorkerAllocator::new(
            self.create_workers(count)?,
        )))
    }

    /// Non-shareable pool of `count` workers, for one owner per partition
    pub fn create_exclusive_pool(&self, count: usize) -> Result<Arc<dyn WorkerAllocator>> {
        Ok(Arc::new(FixedPoolWorkerAllocator::exclusive(
            self.create_workers(count)?,
        )))
    }

    pub fn create_singleton(&self) -> Result<Arc<dyn WorkerAllocator>> {
        let worker = self
            .create_workers(1)?
            .pop()
            .ok_or_else(|| crate::error::DispatchError::Internal("No worker created".to_string()))?;
        Ok(Arc::new(SingletonWorkerAllocator::new(worker)))
    }
}
