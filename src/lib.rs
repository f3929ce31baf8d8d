#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Event Source Core
//!
//! Event ingestion and dispatch core of a serverless function processor.
//!
//! ## Overview
//!
//! Triggers of very different shapes (synchronous HTTP requests, queue
//! deliveries, shard-partitioned streams, polled storage listings, synthetic
//! load) all turn their stimulus into an [`Event`] and hand it to one of a
//! bounded set of workers. They share one execution budget through a common
//! submission protocol, so no transport specific code reaches the dispatch path.
//!
//! ## Architecture
//!
//! ```text
//! ProcessorConfig ──▶ Registries ──▶ EventSourceFactory ──▶ EventSource
//!                                          │                    │
//!                                          ▼                    ▼
//!                                   WorkerAllocator ◀── BaseEventSource::submit_event
//!                                          │
//!                                          ▼
//!                                   Worker ──▶ Runtime::process_event
//! ```
//!
//! ## Module Organization
//!
//! - [`worker`] - Workers, the fixed and singleton allocators, scoped leases
//! - [`event`] - The event value object and the reusable [`EventPool`]
//! - [`source`] - The [`EventSource`] capability, the submission protocol and every adapter
//! - [`source::poller`] - The incremental polling state machine and the item poller
//! - [`registry`] - Kind → factory tables resolved at bootstrap
//! - [`processor`] - Bootstrap and lifecycle of all configured triggers
//! - [`runtime`] - The function runtime capability consumed by workers
//! - [`statistics`] - Monotonic counters read by external exporters
//! - [`config`] - YAML and environment configuration
//! - [`logging`] - Structured logging setup
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use eventsource_core::config::ConfigLoader;
//! use eventsource_core::processor::Processor;
//! use eventsource_core::registry::Registries;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::load(None)?;
//! let registries = Registries::with_builtins()?;
//!
//! let processor = Processor::new(&config, &registries)?;
//! processor.start().await?;
//! // ...
//! let checkpoints = processor.stop(false).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod pool;
pub mod processor;
pub mod registry;
pub mod runtime;
pub mod source;
pub mod statistics;
pub mod worker;

pub use config::{ProcessorConfig, RuntimeConfig, TriggerConfig};
pub use error::{DispatchError, Result};
pub use event::{Event, EventPool, PooledEvent};
pub use processor::{Processor, ProcessorStatistics};
pub use registry::{EventSourceRegistry, Registries, Registry, RuntimeRegistry};
pub use runtime::{ProcessError, ProcessResult, Response, Runtime, RuntimeFactory};
pub use source::{
    BaseEventSource, BatchOutcome, Checkpoint, EventSource, EventSourceFactory, SourceClass,
    SourceInfo, SubmitOutcome,
};
pub use statistics::{SourceStatisticsSnapshot, WorkerStatisticsSnapshot};
pub use worker::{
    FixedPoolWorkerAllocator, SingletonWorkerAllocator, Worker, WorkerAllocator, WorkerFactory,
    WorkerLease,
};
