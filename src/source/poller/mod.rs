//! # Incremental Polling Skeleton
//!
//! Generic state machine for pull-based sources. A [`PollerDriver`] knows how
//! to enumerate changed items and how to checkpoint processed ones;
//! [`PollingEventSource`] runs the cycle around it:
//!
//! ```text
//! ColdStart ──first cycle done──▶ Polling ◀──────┐
//!     │                              │          │
//!     └──────── batch full ──────────┴─▶ Checkpointing
//! ```
//!
//! During a cycle the driver streams [`PollMessage::Event`]s into a channel
//! and ends with [`PollMessage::CycleComplete`] once every partition finished.
//! Events are grouped into batches of at most `max_batch_size`, each batch is
//! submitted to a single worker, and the results go back to the driver so it
//! can checkpoint the events that succeeded.

pub mod in_memory;
pub mod item_poller;
pub mod query;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::{
    BaseEventSource, BatchOutcome, Checkpoint, EventSource, ShutdownSignal, SourceClass,
    SourceTasks,
};
use crate::error::Result;
use crate::event::Event;
use crate::logging::log_source_operation;
use crate::runtime::ProcessResult;
use crate::statistics::SourceStatisticsSnapshot;
use crate::worker::{Worker, WorkerAllocator};

pub use in_memory::InMemoryItemStore;
pub use item_poller::{ItemPoller, ItemPollerConfig, ItemPollerFactory, ItemStore};

#[derive(Debug)]
pub enum PollMessage {
    Event(Event),
    /// Every partition of the current cycle has been enumerated
    CycleComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerPhase {
    ColdStart,
    Polling,
    Checkpointing,
}

/// Source specific half of a poller
#[async_trait]
pub trait PollerDriver: Send + Sync {
    /// Enumerate one cycle's worth of changed items into `events`, finishing
    /// with `PollMessage::CycleComplete`
    async fn get_new_events(&self, events: mpsc::Sender<PollMessage>) -> Result<()>;

    /// Checkpoint the events of a processed batch. `results[i]` belongs to
    /// `events[i]`.
    async fn post_process_events(&self, events: &[Event], results: &[ProcessResult]);

    fn config(&self) -> serde_json::Value;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Pause between cycles
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_batch_size() -> usize {
    64
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

struct PollLoop<D> {
    base: BaseEventSource,
    driver: Arc<D>,
    config: PollerConfig,
    timeout: Duration,
    phase: Mutex<PollerPhase>,
    cycles_completed: AtomicU64,
}

impl<D: PollerDriver + 'static> PollLoop<D> {
    async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let interval = Duration::from_millis(self.config.interval_ms);

        while !shutdown.is_triggered() {
            self.run_cycle(&shutdown).await;

            let cycles = self.cycles_completed.fetch_add(1, Ordering::Relaxed) + 1;
            *self.phase.lock() = PollerPhase::Polling;
            debug!(source_id = %self.base.id(), cycles = cycles, "Poll cycle complete");

            if !shutdown.sleep(interval).await {
                break;
            }
        }
    }

    async fn run_cycle(&self, shutdown: &ShutdownSignal) {
        let (sender, receiver) = mpsc::channel(self.config.max_batch_size.max(1));

        let producer = async {
            if let Err(e) = self.driver.get_new_events(sender).await {
                warn!(source_id = %self.base.id(), error = %e, "Failed to get new events");
            }
        };

        tokio::join!(producer, self.consume(receiver, shutdown));
    }

    async fn consume(&self, mut receiver: mpsc::Receiver<PollMessage>, shutdown: &ShutdownSignal) {
        let batch_size = self.config.max_batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);

        while let Some(message) = receiver.recv().await {
            match message {
                PollMessage::Event(event) => {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        if shutdown.is_triggered() {
                            return;
                        }
                        self.process_batch(std::mem::take(&mut batch)).await;
                    }
                }
                PollMessage::CycleComplete => break,
            }
        }

        if !batch.is_empty() && !shutdown.is_triggered() {
            self.process_batch(batch).await;
        }
    }

    async fn process_batch(&self, mut events: Vec<Event>) {
        match self.base.submit_events(&mut events, Some(self.timeout)).await {
            BatchOutcome::NoWorker(err) => {
                warn!(
                    source_id = %self.base.id(),
                    batch_size = events.len(),
                    error = %err,
                    "Failed to submit batch, items stay unprocessed"
                );
            }
            BatchOutcome::Processed(results) => {
                let previous = std::mem::replace(&mut *self.phase.lock(), PollerPhase::Checkpointing);
                self.driver.post_process_events(&events, &results).await;
                *self.phase.lock() = previous;
            }
        }
    }
}

pub struct PollingEventSource<D> {
    inner: Arc<PollLoop<D>>,
    tasks: SourceTasks,
}

impl<D: PollerDriver + 'static> PollingEventSource<D> {
    pub fn new(
        id: &str,
        kind: &str,
        driver: Arc<D>,
        config: PollerConfig,
        timeout: Duration,
        allocator: Arc<dyn WorkerAllocator>,
    ) -> Self {
        let inner = PollLoop {
            base: BaseEventSource::new(id, kind, SourceClass::Async, allocator),
            driver,
            config,
            timeout,
            phase: Mutex::new(PollerPhase::ColdStart),
            cycles_completed: AtomicU64::new(0),
        };

        Self {
            inner: Arc::new(inner),
            tasks: SourceTasks::new(),
        }
    }

    pub fn phase(&self) -> PollerPhase {
        *self.inner.phase.lock()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.inner.cycles_completed.load(Ordering::Relaxed)
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.inner.driver
    }
}

#[async_trait]
impl<D: PollerDriver + 'static> EventSource for PollingEventSource<D> {
    fn id(&self) -> &str {
        self.inner.base.id()
    }

    fn class(&self) -> SourceClass {
        SourceClass::Async
    }

    fn kind(&self) -> &str {
        self.inner.base.kind()
    }

    #[instrument(skip(self, _checkpoint), fields(source_id = %self.id()))]
    async fn start(&self, _checkpoint: Checkpoint) -> Result<()> {
        let signal = self.tasks.begin()?;
        self.tasks.spawn(Arc::clone(&self.inner).run(signal));

        let details = format!(
            "interval_ms={} max_batch_size={}",
            self.inner.config.interval_ms, self.inner.config.max_batch_size
        );
        log_source_operation("start", self.id(), self.kind(), "success", Some(&details));
        Ok(())
    }

    /// Progress lives on the items themselves, so there is nothing to return
    async fn stop(&self, force: bool) -> Result<Checkpoint> {
        self.tasks.shutdown(force).await;
        log_source_operation("stop", self.id(), self.kind(), "success", None);
        Ok(Checkpoint::none())
    }

    fn statistics(&self) -> SourceStatisticsSnapshot {
        self.inner.base.statistics()
    }

    fn workers(&self) -> Vec<Arc<Worker>> {
        self.inner.base.workers()
    }

    fn config(&self) -> serde_json::Value {
        let mut config = self.inner.driver.config();
        if let serde_json::Value::Object(map) = &mut config {
            map.insert(
                "interval_ms".to_string(),
                serde_json::Value::from(self.inner.config.interval_ms),
            );
            map.insert(
                "max_batch_size".to_string(),
                serde_json::Value::from(self.inner.config.max_batch_size),
            );
        }
        config
    }
}
