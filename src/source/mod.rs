//! # Event Sources
//!
//! An event source (trigger) turns an external stimulus into [`Event`]s and
//! routes each of them to a worker. Every adapter implements [`EventSource`]
//! and composes a [`BaseEventSource`] for the submission protocol, so no
//! adapter carries its own dispatch logic.
//!
//! ## Adapters
//!
//! - [`http`]: synchronous request/response over axum
//! - [`generator`]: synthetic load at a randomized rate
//! - [`queue`]: asynchronous push deliveries (nats, rabbit-mq)
//! - [`stream`]: shard-partitioned pull (kinesis)
//! - [`poller`]: incremental storage listing (v3io-item-poller)

pub mod base;
pub mod generator;
pub mod http;
pub mod lifecycle;
pub mod poller;
pub mod queue;
pub mod stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::TriggerConfig;
use crate::error::Result;
use crate::statistics::SourceStatisticsSnapshot;
use crate::worker::{Worker, WorkerFactory};

pub use base::{BaseEventSource, BatchOutcome, SubmitOutcome};
pub use lifecycle::{ShutdownSignal, SourceTasks};

/// Whether the producer waits for the function's response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceClass {
    Sync,
    Async,
}

impl SourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceClass::Sync => "sync",
            SourceClass::Async => "async",
        }
    }
}

impl fmt::Display for SourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a source as seen by the functions it triggers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub kind: String,
    pub class: SourceClass,
}

impl SourceInfo {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, class: SourceClass) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            class,
        }
    }
}

/// Opaque resumption token owned by the source that produced it.
/// `None` means cold start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint(pub Option<String>);

impl Checkpoint {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    fn id(&self) -> &str;

    fn class(&self) -> SourceClass;

    fn kind(&self) -> &str;

    /// Begin producing events, resuming from `checkpoint` when the source
    /// understands it
    async fn start(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Stop producing events. `force = false` lets in-flight work finish,
    /// `force = true` abandons it. Returns the position to resume from.
    async fn stop(&self, force: bool) -> Result<Checkpoint>;

    fn statistics(&self) -> SourceStatisticsSnapshot;

    fn workers(&self) -> Vec<Arc<Worker>>;

    /// JSON view of the source's effective configuration
    fn config(&self) -> serde_json::Value;
}

/// Builds an event source of one kind from its trigger configuration
pub trait EventSourceFactory: Send + Sync {
    fn create(
        &self,
        id: &str,
        config: &TriggerConfig,
        worker_factory: &WorkerFactory,
    ) -> Result<Arc<dyn EventSource>>;
}

impl<F> EventSourceFactory for F
where
    F: Fn(&str, &TriggerConfig, &WorkerFactory) -> Result<Arc<dyn EventSource>> + Send + Sync,
{
    fn create(
        &self,
        id: &str,
        config: &TriggerConfig,
        worker_factory: &WorkerFactory,
    ) -> Result<Arc<dyn EventSource>> {
        self(id, config, worker_factory)
    }
}
