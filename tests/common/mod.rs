//! Shared fixtures for integration tests.

#![allow(dead_code)]

pub mod runtimes;

pub use runtimes::*;

use std::sync::Arc;

use eventsource_core::config::{RuntimeConfig, TriggerConfig};
use eventsource_core::runtime::{Runtime, RuntimeFactory};
use eventsource_core::worker::{Worker, WorkerFactory};
use eventsource_core::Result;

/// `count` workers all sharing one runtime instance
pub fn workers_with(runtime: Arc<dyn Runtime>, count: usize) -> Vec<Arc<Worker>> {
    (0..count)
        .map(|index| Arc::new(Worker::new(index, Arc::clone(&runtime))))
        .collect()
}

/// Worker factory handing every worker the same runtime instance
pub fn shared_runtime_factory(runtime: Arc<dyn Runtime>) -> WorkerFactory {
    let factory = move |_config: &RuntimeConfig, _index: usize| -> Result<Arc<dyn Runtime>> {
        Ok(Arc::clone(&runtime))
    };
    let factory: Arc<dyn RuntimeFactory> = Arc::new(factory);
    WorkerFactory::new(factory, RuntimeConfig::default())
}

/// Trigger config with a short worker wait, as most tests want
pub fn trigger(kind: &str) -> TriggerConfig {
    let mut trigger = TriggerConfig::new(kind);
    trigger.worker_availability_timeout_ms = 1_000;
    trigger
}

/// Poll `condition` every few milliseconds for up to two seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    condition()
}
