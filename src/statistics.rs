//! # Dispatch Statistics
//!
//! Monotonic counters kept by every event source and worker. An external
//! exporter reads two snapshots and diffs them to obtain per-period deltas;
//! the counters themselves only ever grow.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters maintained by an event source
#[derive(Debug, Default)]
pub struct SourceStatistics {
    events_handled_success_total: AtomicU64,
    events_handled_failure_total: AtomicU64,
    allocation_failures_total: AtomicU64,
}

impl SourceStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.events_handled_success_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.events_handled_failure_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// No worker could be allocated. Counted as a failed event as well.
    pub fn record_allocation_failure(&self) {
        self.allocation_failures_total.fetch_add(1, Ordering::Relaxed);
        self.record_failure();
    }

    pub fn snapshot(&self) -> SourceStatisticsSnapshot {
        SourceStatisticsSnapshot {
            events_handled_success_total: self.events_handled_success_total.load(Ordering::Relaxed),
            events_handled_failure_total: self.events_handled_failure_total.load(Ordering::Relaxed),
            allocation_failures_total: self.allocation_failures_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatisticsSnapshot {
    pub events_handled_success_total: u64,
    pub events_handled_failure_total: u64,
    pub allocation_failures_total: u64,
}

impl SourceStatisticsSnapshot {
    /// Change since `previous`
    pub fn diff(&self, previous: &Self) -> Self {
        Self {
            events_handled_success_total: self
                .events_handled_success_total
                .saturating_sub(previous.events_handled_success_total),
            events_handled_failure_total: self
                .events_handled_failure_total
                .saturating_sub(previous.events_handled_failure_total),
            allocation_failures_total: self
                .allocation_failures_total
                .saturating_sub(previous.allocation_failures_total),
        }
    }

    pub fn events_handled_total(&self) -> u64 {
        self.events_handled_success_total + self.events_handled_failure_total
    }
}

/// Counters maintained by a worker
#[derive(Debug, Default)]
pub struct WorkerStatistics {
    events_handled_success_total: AtomicU64,
    events_handled_failure_total: AtomicU64,
    processing_duration_us_total: AtomicU64,
    processing_count_total: AtomicU64,
}

impl WorkerStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, success: bool, duration: Duration) {
        if success {
            self.events_handled_success_total
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.events_handled_failure_total
                .fetch_add(1, Ordering::Relaxed);
        }
        self.processing_duration_us_total
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.processing_count_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatisticsSnapshot {
        WorkerStatisticsSnapshot {
            events_handled_success_total: self.events_handled_success_total.load(Ordering::Relaxed),
            events_handled_failure_total: self.events_handled_failure_total.load(Ordering::Relaxed),
            processing_duration_us_total: self.processing_duration_us_total.load(Ordering::Relaxed),
            processing_count_total: self.processing_count_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatisticsSnapshot {
    pub events_handled_success_total: u64,
    pub events_handled_failure_total: u64,
    pub processing_duration_us_total: u64,
    pub processing_count_total: u64,
}

impl WorkerStatisticsSnapshot {
    pub fn diff(&self, previous: &Self) -> Self {
        Self {
            events_handled_success_total: self
                .events_handled_success_total
                .saturating_sub(previous.events_handled_success_total),
            events_handled_failure_total: self
                .events_handled_failure_total
                .saturating_sub(previous.events_handled_failure_total),
            processing_duration_us_total: self
                .processing_duration_us_total
                .saturating_sub(previous.processing_duration_us_total),
            processing_count_total: self
                .processing_count_total
                .saturating_sub(previous.processing_count_total),
        }
    }

    /// Mean processing time, if anything was processed
    pub fn average_processing_duration(&self) -> Option<Duration> {
        if self.processing_count_total == 0 {
            return None;
        }
        Some(Duration::from_micros(
            self.processing_duration_us_total / self.processing_count_total,
        ))
    }
}
