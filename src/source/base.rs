//! # Submission Protocol
//!
//! [`BaseEventSource`] is composed into every adapter. It stamps events with
//! the source identity, allocates a worker under a timeout, runs the function
//! and hands the worker back on every exit path. The outcome types keep the two
//! failure modes apart: `NoWorker` means no user code ran at all, `Failed`
//! means the function ran and reported an error.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{SourceClass, SourceInfo};
use crate::error::{DispatchError, Result};
use crate::event::Event;
use crate::runtime::{ProcessError, ProcessResult, Response};
use crate::statistics::{SourceStatistics, SourceStatisticsSnapshot};
use crate::worker::{Worker, WorkerAllocator, WorkerLease};

/// Result of submitting one event
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// No worker could be allocated; the function never ran
    NoWorker(DispatchError),
    /// The function ran and returned an error
    Failed(ProcessError),
    /// The function ran and returned a response
    Completed(Response),
}

impl SubmitOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SubmitOutcome::Completed(_))
    }

    pub fn submit_error(&self) -> Option<&DispatchError> {
        match self {
            SubmitOutcome::NoWorker(err) => Some(err),
            _ => None,
        }
    }

    pub fn process_error(&self) -> Option<&ProcessError> {
        match self {
            SubmitOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProcessResult> for SubmitOutcome {
    fn from(result: ProcessResult) -> Self {
        match result {
            Ok(response) => SubmitOutcome::Completed(response),
            Err(err) => SubmitOutcome::Failed(err),
        }
    }
}

/// Result of submitting a batch to a single worker
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// No worker could be allocated; no event in the batch was processed
    NoWorker(DispatchError),
    /// One result per event, in submission order
    Processed(Vec<ProcessResult>),
}

#[derive(Debug)]
pub struct BaseEventSource {
    info: Arc<SourceInfo>,
    allocator: Arc<dyn WorkerAllocator>,
    statistics: SourceStatistics,
}

impl BaseEventSource {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        class: SourceClass,
        allocator: Arc<dyn WorkerAllocator>,
    ) -> Self {
        Self {
            info: Arc::new(SourceInfo::new(id, kind, class)),
            allocator,
            statistics: SourceStatistics::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn kind(&self) -> &str {
        &self.info.kind
    }

    pub fn class(&self) -> SourceClass {
        self.info.class
    }

    pub fn info(&self) -> &Arc<SourceInfo> {
        &self.info
    }

    pub fn allocator(&self) -> &Arc<dyn WorkerAllocator> {
        &self.allocator
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.allocator.workers()
    }

    pub fn statistics(&self) -> SourceStatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// Fan-out sources call this before starting; a non-shareable allocator
    /// would let concurrent tasks interleave on a pool meant for one owner.
    pub fn require_shareable(&self) -> Result<()> {
        if self.allocator.shareable() {
            Ok(())
        } else {
            Err(DispatchError::Configuration(format!(
                "Event source '{}' ({}) requires a shareable worker allocator",
                self.info.id, self.info.kind
            )))
        }
    }

    /// Stamp the event with this source and make sure it has an ID
    pub fn prepare_event(&self, event: &mut Event) {
        event.set_source(&self.info);
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }
    }

    /// Allocate a worker, process one event, release the worker
    pub async fn submit_event(&self, event: &mut Event, timeout: Option<Duration>) -> SubmitOutcome {
        self.prepare_event(event);

        let lease = match WorkerLease::acquire(&self.allocator, timeout).await {
            Ok(lease) => lease,
            Err(err) => {
                self.statistics.record_allocation_failure();
                warn!(
                    source_id = %self.info.id,
                    event_id = %event.id,
                    error = %err,
                    "Failed to allocate worker"
                );
                return SubmitOutcome::NoWorker(err);
            }
        };

        let result = lease.process_event(event).await;
        drop(lease);

        self.record(&result);
        result.into()
    }

    /// Allocate one worker and process every event against it in order
    pub async fn submit_events(
        &self,
        events: &mut [Event],
        timeout: Option<Duration>,
    ) -> BatchOutcome {
        for event in events.iter_mut() {
            self.prepare_event(event);
        }

        let lease = match WorkerLease::acquire(&self.allocator, timeout).await {
            Ok(lease) => lease,
            Err(err) => {
                self.statistics.record_allocation_failure();
                warn!(
                    source_id = %self.info.id,
                    batch_size = events.len(),
                    error = %err,
                    "Failed to allocate worker for batch"
                );
                return BatchOutcome::NoWorker(err);
            }
        };

        let mut results = Vec::with_capacity(events.len());
        for event in events.iter() {
            let result = lease.process_event(event).await;
            self.record(&result);
            results.push(result);
        }

        debug!(
            source_id = %self.info.id,
            worker = lease.index(),
            batch_size = results.len(),
            "Processed batch"
        );

        BatchOutcome::Processed(results)
    }

    /// Process an event on a worker the caller already owns, as shard readers
    /// do with the worker bound to their shard
    pub async fn submit_to_worker(&self, worker: &Worker, event: &mut Event) -> ProcessResult {
        self.prepare_event(event);
        let result = worker.process_event(event).await;
        self.record(&result);
        result
    }

    /// Allocate a worker for the caller to keep, e.g. for a partition's lifetime
    pub async fn allocate_worker(&self, timeout: Option<Duration>) -> Result<WorkerLease> {
        WorkerLease::acquire(&self.allocator, timeout)
            .await
            .inspect_err(|_| self.statistics.record_allocation_failure())
    }

    fn record(&self, result: &ProcessResult) {
        match result {
            Ok(_) => self.statistics.record_success(),
            Err(err) => {
                self.statistics.record_failure();
                debug!(
                    source_id = %self.info.id,
                    error = %err,
                    "Function returned an error"
                );
            }
        }
    }
}
