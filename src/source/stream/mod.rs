//! # Shard Stream Event Source
//!
//! Asynchronous pull trigger over a shard-partitioned stream (kind `kinesis`).
//! One reader task runs per configured shard, bound for its whole lifetime to a
//! worker drawn once from a non-shareable pool sized to the shard count.
//!
//! Each reader resolves its starting position (retrying until the client
//! answers), then repeatedly sleeps, fetches a batch, submits every record to
//! its worker and advances to the position the client returned. A failed fetch
//! is retried from the same position; records are never skipped.
//!
//! The checkpoint is a JSON object mapping shard ID to the sequence number of
//! the last record handed to the function on that shard.

pub mod in_memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::{
    BaseEventSource, Checkpoint, EventSource, EventSourceFactory, ShutdownSignal, SourceClass,
    SourceTasks,
};
use crate::config::TriggerConfig;
use crate::error::{DispatchError, Result};
use crate::event::Event;
use crate::logging::log_source_operation;
use crate::statistics::SourceStatisticsSnapshot;
use crate::worker::{Worker, WorkerAllocator, WorkerFactory, WorkerLease};

pub use in_memory::InMemoryStream;

pub const KIND: &str = "kinesis";

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub sequence_number: String,
    pub partition_key: String,
    pub data: Vec<u8>,
    pub arrived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    /// Position to fetch from next
    pub next_position: String,
}

/// Client side of a shard-partitioned stream
#[async_trait]
pub trait ShardClient: Send + Sync + fmt::Debug {
    /// Position to start reading `shard_id` from. With `after_sequence` the
    /// position follows that record, otherwise the oldest available record.
    async fn initial_position(
        &self,
        stream_name: &str,
        shard_id: &str,
        after_sequence: Option<&str>,
    ) -> Result<String>;

    async fn get_records(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &str,
        limit: usize,
    ) -> Result<RecordBatch>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub stream_name: String,

    pub shards: Vec<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    100
}

impl StreamConfig {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

type Positions = Arc<DashMap<String, String>>;

struct ShardReader {
    base: Arc<BaseEventSource>,
    client: Arc<dyn ShardClient>,
    config: StreamConfig,
    shard_id: String,
    positions: Positions,
}

impl ShardReader {
    async fn run(self, mut shutdown: ShutdownSignal) {
        let worker = tokio::select! {
            _ = shutdown.triggered() => return,
            lease = self.base.allocate_worker(None) => lease,
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                error!(
                    source_id = %self.base.id(),
                    shard_id = %self.shard_id,
                    error = %e,
                    "Failed to allocate worker for shard"
                );
                return;
            }
        };

        let Some(mut position) = self.resolve_position(&mut shutdown).await else {
            return;
        };

        info!(
            source_id = %self.base.id(),
            shard_id = %self.shard_id,
            worker = worker.index(),
            "Shard reader started"
        );

        while shutdown.sleep(self.config.poll_interval()).await {
            let fetched = tokio::select! {
                _ = shutdown.triggered() => break,
                fetched = self.client.get_records(
                    &self.config.stream_name,
                    &self.shard_id,
                    &position,
                    self.config.batch_size,
                ) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(
                        source_id = %self.base.id(),
                        shard_id = %self.shard_id,
                        position = %position,
                        error = %e,
                        "Failed to get records, retrying from same position"
                    );
                    continue;
                }
            };

            if !self.process_batch(&worker, batch.records, &shutdown).await {
                break;
            }
            position = batch.next_position;
        }

        debug!(source_id = %self.base.id(), shard_id = %self.shard_id, "Shard reader stopped");
    }

    async fn resolve_position(&self, shutdown: &mut ShutdownSignal) -> Option<String> {
        let resume = self.positions.get(&self.shard_id).map(|p| p.value().clone());

        loop {
            match self
                .client
                .initial_position(&self.config.stream_name, &self.shard_id, resume.as_deref())
                .await
            {
                Ok(position) => return Some(position),
                Err(e) => {
                    warn!(
                        source_id = %self.base.id(),
                        shard_id = %self.shard_id,
                        error = %e,
                        "Failed to get initial shard position"
                    );
                    if !shutdown.sleep(self.config.poll_interval()).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Returns false if shutdown interrupted the batch
    async fn process_batch(
        &self,
        worker: &WorkerLease,
        records: Vec<Record>,
        shutdown: &ShutdownSignal,
    ) -> bool {
        for record in records {
            if shutdown.is_triggered() {
                return false;
            }

            let mut event = Event::new(record.data)
                .with_id(record.sequence_number.clone())
                .with_path(self.shard_id.clone())
                .with_timestamp(record.arrived_at)
                .with_attribute("shard_id", serde_json::Value::from(self.shard_id.clone()))
                .with_attribute(
                    "sequence_number",
                    serde_json::Value::from(record.sequence_number.clone()),
                )
                .with_attribute("partition_key", serde_json::Value::from(record.partition_key));

            if let Err(e) = self.base.submit_to_worker(worker, &mut event).await {
                debug!(
                    source_id = %self.base.id(),
                    shard_id = %self.shard_id,
                    sequence_number = %record.sequence_number,
                    error = %e,
                    "Function failed on record"
                );
            }

            self.positions
                .insert(self.shard_id.clone(), record.sequence_number);
        }
        true
    }
}

pub struct StreamEventSource {
    base: Arc<BaseEventSource>,
    client: Arc<dyn ShardClient>,
    config: StreamConfig,
    positions: Positions,
    tasks: SourceTasks,
}

impl StreamEventSource {
    pub fn new(
        id: &str,
        config: StreamConfig,
        client: Arc<dyn ShardClient>,
        allocator: Arc<dyn WorkerAllocator>,
    ) -> Self {
        Self {
            base: Arc::new(BaseEventSource::new(id, KIND, SourceClass::Async, allocator)),
            client,
            config,
            positions: Arc::new(DashMap::new()),
            tasks: SourceTasks::new(),
        }
    }

    fn restore(&self, checkpoint: &Checkpoint) -> Result<()> {
        let Some(token) = checkpoint.as_deref() else {
            return Ok(());
        };

        let positions: BTreeMap<String, String> = serde_json::from_str(token)
            .map_err(|e| DispatchError::Configuration(format!("Invalid stream checkpoint: {e}")))?;
        for (shard_id, sequence) in positions {
            self.positions.insert(shard_id, sequence);
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<Checkpoint> {
        if self.positions.is_empty() {
            return Ok(Checkpoint::none());
        }

        let positions: BTreeMap<String, String> = self
            .positions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        Ok(Checkpoint::new(serde_json::to_string(&positions)?))
    }
}

#[async_trait]
impl EventSource for StreamEventSource {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn class(&self) -> SourceClass {
        SourceClass::Async
    }

    fn kind(&self) -> &str {
        KIND
    }

    #[instrument(skip(self, checkpoint), fields(source_id = %self.id()))]
    async fn start(&self, checkpoint: Checkpoint) -> Result<()> {
        self.restore(&checkpoint)?;
        let signal = self.tasks.begin()?;

        for shard_id in &self.config.shards {
            let reader = ShardReader {
                base: Arc::clone(&self.base),
                client: Arc::clone(&self.client),
                config: self.config.clone(),
                shard_id: shard_id.clone(),
                positions: Arc::clone(&self.positions),
            };
            self.tasks.spawn(reader.run(signal.clone()));
        }

        let details = format!(
            "stream={} shards={}",
            self.config.stream_name,
            self.config.shards.len()
        );
        log_source_operation("start", self.id(), KIND, "success", Some(&details));
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<Checkpoint> {
        self.tasks.shutdown(force).await;
        let checkpoint = self.checkpoint()?;
        log_source_operation("stop", self.id(), KIND, "success", checkpoint.as_deref());
        Ok(checkpoint)
    }

    fn statistics(&self) -> SourceStatisticsSnapshot {
        self.base.statistics()
    }

    fn workers(&self) -> Vec<Arc<Worker>> {
        self.base.workers()
    }

    fn config(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
    }
}

/// `kinesis` triggers bound to one stream client
#[derive(Debug, Clone)]
pub struct StreamEventSourceFactory {
    client: Arc<dyn ShardClient>,
}

impl StreamEventSourceFactory {
    pub fn new(client: Arc<dyn ShardClient>) -> Self {
        Self { client }
    }
}

impl EventSourceFactory for StreamEventSourceFactory {
    fn create(
        &self,
        id: &str,
        trigger: &TriggerConfig,
        worker_factory: &WorkerFactory,
    ) -> Result<Arc<dyn EventSource>> {
        let config: StreamConfig = trigger.typed_attributes(id)?;
        if config.shards.is_empty() {
            return Err(DispatchError::Configuration(format!(
                "Trigger '{id}': at least one shard is required"
            )));
        }
        let distinct: BTreeSet<&str> = config.shards.iter().map(String::as_str).collect();
        if distinct.len() != config.shards.len() {
            return Err(DispatchError::Configuration(format!(
                "Trigger '{id}': shard IDs must be unique, got {:?}",
                config.shards
            )));
        }
        if let Some(requested) = trigger.num_workers {
            if requested != config.shards.len() {
                warn!(
                    source_id = %id,
                    num_workers = requested,
                    shards = config.shards.len(),
                    "Ignoring num_workers, stream pools are sized to the shard count"
                );
            }
        }

        let allocator = worker_factory.create_exclusive_pool(config.shards.len())?;
        Ok(Arc::new(StreamEventSource::new(
            id,
            config,
            Arc::clone(&self.client),
            allocator,
        )))
    }
}
