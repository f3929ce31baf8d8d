//! # Item Poller
//!
//! [`PollerDriver`] over a key/value item store (kind `v3io-item-poller`).
//! Each cycle lists every configured path concurrently, page by page, and turns
//! each item into an event. After a batch is processed, every item whose event
//! succeeded gets its mtime stamped into two checkpoint attributes private to
//! this source; the steady-state query then only matches items modified since.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::query::{attributes_to_request, build_query, CheckpointAttributes, QueryParts};
use super::{PollMessage, PollerConfig, PollerDriver, PollingEventSource};
use crate::config::TriggerConfig;
use crate::error::{DispatchError, Result};
use crate::event::Event;
use crate::runtime::ProcessResult;
use crate::source::{EventSource, EventSourceFactory};
use crate::worker::WorkerFactory;

pub const KIND: &str = "v3io-item-poller";

const DEFAULT_NUM_WORKERS: usize = 1;

/// Attempts at fetching one page before giving up on a path for this cycle
const PAGE_FETCH_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub name: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Item {
    /// Modification time from `__mtime_secs`/`__mtime_nsecs`
    pub fn mtime(&self) -> Option<DateTime<Utc>> {
        let secs = self.attributes.get("__mtime_secs")?.as_i64()?;
        let nsecs = self
            .attributes
            .get("__mtime_nsecs")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        Utc.timestamp_opt(secs, u32::try_from(nsecs).ok()?).single()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetItemsRequest {
    pub path: String,
    /// Comma separated attribute projection
    pub attributes: String,
    pub query: String,
    /// Empty for the first page
    pub marker: String,
    pub limit: usize,
    pub shard_id: usize,
    pub total_shards: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetItemsResponse {
    pub items: Vec<Item>,
    pub last_item_included: bool,
    pub next_marker: String,
}

/// Client side of an item store
#[async_trait]
pub trait ItemStore: Send + Sync + fmt::Debug {
    async fn get_items(&self, request: &GetItemsRequest) -> Result<GetItemsResponse>;

    /// Merge `attributes` into the item at `path`
    async fn update_item(
        &self,
        path: &str,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemPollerConfig {
    pub paths: Vec<String>,

    /// Extra attributes to fetch with every item
    #[serde(default)]
    pub attributes: Vec<String>,

    /// Extra filter clauses, AND-ed with the generated ones
    #[serde(default)]
    pub queries: Vec<String>,

    /// Only items whose name ends with one of these
    #[serde(default)]
    pub suffixes: Vec<String>,

    /// Only items changed since they were last checkpointed
    #[serde(default = "default_incremental")]
    pub incremental: bool,

    #[serde(default)]
    pub shard_id: usize,

    #[serde(default = "default_total_shards")]
    pub total_shards: usize,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Pause between page fetches of one path
    #[serde(default)]
    pub page_delay_ms: u64,

    #[serde(flatten)]
    pub poller: PollerConfig,
}

fn default_incremental() -> bool {
    true
}

fn default_total_shards() -> usize {
    1
}

fn default_page_size() -> usize {
    250
}

impl ItemPollerConfig {
    fn validate(&self, id: &str) -> Result<()> {
        if self.paths.is_empty() {
            return Err(DispatchError::Configuration(format!(
                "Trigger '{id}': at least one path is required"
            )));
        }
        if self.total_shards == 0 || self.shard_id >= self.total_shards {
            return Err(DispatchError::Configuration(format!(
                "Trigger '{id}': shard_id {} out of range for {} total shards",
                self.shard_id, self.total_shards
            )));
        }
        if self.page_size == 0 {
            return Err(DispatchError::Configuration(format!(
                "Trigger '{id}': page_size must be greater than zero"
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct QueryState {
    first_poll: bool,
    query: String,
}

#[derive(Debug)]
pub struct ItemPoller {
    store: Arc<dyn ItemStore>,
    config: ItemPollerConfig,
    checkpoint: CheckpointAttributes,
    attributes: String,
    state: Mutex<QueryState>,
}

impl ItemPoller {
    pub fn new(source_id: &str, config: ItemPollerConfig, store: Arc<dyn ItemStore>) -> Self {
        let checkpoint = CheckpointAttributes::for_source(source_id);
        let attributes = attributes_to_request(&checkpoint, &config.attributes);

        let mut poller = Self {
            store,
            config,
            checkpoint,
            attributes,
            state: Mutex::new(QueryState {
                first_poll: true,
                query: String::new(),
            }),
        };
        let query = poller.generate_query(true);
        poller.state.get_mut().query = query;

        debug!(
            source_id = %source_id,
            attributes = %poller.attributes,
            query = %poller.query(),
            "Created item poller"
        );
        poller
    }

    pub fn query(&self) -> String {
        self.state.lock().query.clone()
    }

    pub fn attributes(&self) -> &str {
        &self.attributes
    }

    pub fn is_first_poll(&self) -> bool {
        self.state.lock().first_poll
    }

    pub fn checkpoint_attributes(&self) -> &CheckpointAttributes {
        &self.checkpoint
    }

    fn generate_query(&self, first_poll: bool) -> String {
        build_query(&QueryParts {
            first_poll,
            incremental: self.config.incremental,
            checkpoint: &self.checkpoint,
            suffixes: &self.config.suffixes,
            user_queries: &self.config.queries,
        })
    }

    /// The cold start query never filters on checkpoints; once a cycle has
    /// stamped them the query switches to the incremental form
    fn complete_first_poll(&self) {
        let mut state = self.state.lock();
        if state.first_poll {
            state.first_poll = false;
            state.query = self.generate_query(false);
            info!(query = %state.query, "First poll complete, switched to incremental query");
        }
    }

    async fn get_items(&self, path: &str, query: &str, events: &mpsc::Sender<PollMessage>) -> Result<usize> {
        let page_delay = Duration::from_millis(self.config.page_delay_ms);
        let mut marker = String::new();
        let mut total = 0;

        loop {
            let request = GetItemsRequest {
                path: path.to_string(),
                attributes: self.attributes.clone(),
                query: query.to_string(),
                marker: marker.clone(),
                limit: self.config.page_size,
                shard_id: self.config.shard_id,
                total_shards: self.config.total_shards,
            };

            let response = self.fetch_page(&request).await?;
            let last_page = response.last_item_included;
            total += response.items.len();

            for item in response.items {
                let event = item_event(path, item);
                if events.send(PollMessage::Event(event)).await.is_err() {
                    // consumer stopped, the cycle is being abandoned
                    return Ok(total);
                }
            }

            if last_page {
                return Ok(total);
            }
            marker = response.next_marker;

            if !page_delay.is_zero() {
                tokio::time::sleep(page_delay).await;
            }
        }
    }

    /// Retries the same marker; never moves past a page it could not read
    async fn fetch_page(&self, request: &GetItemsRequest) -> Result<GetItemsResponse> {
        let mut attempt = 1;
        loop {
            match self.store.get_items(request).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < PAGE_FETCH_ATTEMPTS => {
                    warn!(
                        path = %request.path,
                        marker = %request.marker,
                        attempt = attempt,
                        error = %e,
                        "Failed to get items, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(self.config.page_delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn item_event(path: &str, item: Item) -> Event {
    let item_path = format!("{}/{}", path.trim_end_matches('/'), item.name);
    let timestamp = item.mtime().unwrap_or_else(Utc::now);

    let mut event = Event::new(Vec::new())
        .with_path(item_path)
        .with_timestamp(timestamp);
    event.attributes = item.attributes;
    event
}

#[async_trait]
impl PollerDriver for ItemPoller {
    async fn get_new_events(&self, events: mpsc::Sender<PollMessage>) -> Result<()> {
        let query = self.query();
        info!(paths = ?self.config.paths, query = %query, "Getting new events");

        let listings = self
            .config
            .paths
            .iter()
            .map(|path| self.get_items(path, &query, &events));

        for (path, result) in self.config.paths.iter().zip(join_all(listings).await) {
            match result {
                Ok(count) => debug!(path = %path, items = count, "Listed path"),
                Err(e) => warn!(path = %path, error = %e, "Failed to get items"),
            }
        }

        // ignored: the consumer may already have stopped
        let _ = events.send(PollMessage::CycleComplete).await;

        self.complete_first_poll();
        Ok(())
    }

    async fn post_process_events(&self, events: &[Event], results: &[ProcessResult]) {
        for (event, result) in events.iter().zip(results) {
            if result.is_err() {
                continue;
            }

            let mut attributes = serde_json::Map::new();
            attributes.insert(
                self.checkpoint.secs.clone(),
                serde_json::Value::from(event.timestamp.timestamp()),
            );
            attributes.insert(
                self.checkpoint.nsecs.clone(),
                serde_json::Value::from(event.timestamp.timestamp_subsec_nanos()),
            );

            if let Err(e) = self.store.update_item(&event.path, attributes).await {
                warn!(path = %event.path, error = %e, "Failed to update item");
            }
        }
    }

    fn config(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
    }
}

/// `v3io-item-poller` triggers bound to one item store
#[derive(Debug, Clone)]
pub struct ItemPollerFactory {
    store: Arc<dyn ItemStore>,
}

impl ItemPollerFactory {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self { store }
    }
}

impl EventSourceFactory for ItemPollerFactory {
    fn create(
        &self,
        id: &str,
        trigger: &TriggerConfig,
        worker_factory: &WorkerFactory,
    ) -> Result<Arc<dyn EventSource>> {
        let config: ItemPollerConfig = trigger.typed_attributes(id)?;
        config.validate(id)?;

        let poller_config = config.poller.clone();
        let driver = Arc::new(ItemPoller::new(id, config, Arc::clone(&self.store)));
        let num_workers = trigger.worker_count(id, DEFAULT_NUM_WORKERS)?;
        let allocator = worker_factory.create_fixed_pool(num_workers)?;

        Ok(Arc::new(PollingEventSource::new(
            id,
            KIND,
            driver,
            poller_config,
            trigger.worker_availability_timeout(),
            allocator,
        )))
    }
}
