//! # Generator Event Source
//!
//! Synthetic load for testing a function: `num_workers` tasks each sleep a
//! random delay within the configured bounds and submit a generated event.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{
    BaseEventSource, Checkpoint, EventSource, EventSourceFactory, ShutdownSignal, SourceClass,
    SourceTasks, SubmitOutcome,
};
use crate::config::TriggerConfig;
use crate::error::{DispatchError, Result};
use crate::event::Event;
use crate::logging::log_source_operation;
use crate::statistics::SourceStatisticsSnapshot;
use crate::worker::{Worker, WorkerAllocator, WorkerFactory};

pub const KIND: &str = "generator";

const DEFAULT_NUM_WORKERS: usize = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default)]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Body of every generated event
    #[serde(default)]
    pub body: String,
}

fn default_max_delay_ms() -> u64 {
    1000
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: default_max_delay_ms(),
            body: String::new(),
        }
    }
}

impl GeneratorConfig {
    fn random_delay(&self) -> Duration {
        let millis = if self.max_delay_ms > self.min_delay_ms {
            rand::thread_rng().gen_range(self.min_delay_ms..=self.max_delay_ms)
        } else {
            self.min_delay_ms
        };
        Duration::from_millis(millis)
    }
}

pub struct GeneratorEventSource {
    base: Arc<BaseEventSource>,
    config: GeneratorConfig,
    num_tasks: usize,
    timeout: Duration,
    tasks: SourceTasks,
}

impl GeneratorEventSource {
    pub fn new(
        id: &str,
        trigger: &TriggerConfig,
        config: GeneratorConfig,
        allocator: Arc<dyn WorkerAllocator>,
    ) -> Self {
        let num_tasks = allocator.capacity();
        Self {
            base: Arc::new(BaseEventSource::new(id, KIND, SourceClass::Async, allocator)),
            config,
            num_tasks,
            timeout: trigger.worker_availability_timeout(),
            tasks: SourceTasks::new(),
        }
    }
}

async fn generate(
    base: Arc<BaseEventSource>,
    config: GeneratorConfig,
    timeout: Duration,
    task_index: usize,
    mut shutdown: ShutdownSignal,
) {
    let mut generated: u64 = 0;

    while shutdown.sleep(config.random_delay()).await {
        let mut event = Event::new(config.body.clone())
            .with_path(format!("/generator/{task_index}"))
            .with_attribute("sequence", serde_json::Value::from(generated));
        generated += 1;

        match base.submit_event(&mut event, Some(timeout)).await {
            SubmitOutcome::NoWorker(err) => {
                debug!(source_id = %base.id(), task = task_index, error = %err, "Failed to submit generated event");
            }
            SubmitOutcome::Failed(err) => {
                debug!(source_id = %base.id(), task = task_index, error = %err, "Function failed on generated event");
            }
            SubmitOutcome::Completed(_) => {}
        }
    }

    debug!(source_id = %base.id(), task = task_index, generated = generated, "Generator task stopped");
}

#[async_trait]
impl EventSource for GeneratorEventSource {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn class(&self) -> SourceClass {
        SourceClass::Async
    }

    fn kind(&self) -> &str {
        KIND
    }

    #[instrument(skip(self, _checkpoint), fields(source_id = %self.id()))]
    async fn start(&self, _checkpoint: Checkpoint) -> Result<()> {
        self.base.require_shareable()?;
        let signal = self.tasks.begin()?;

        for task_index in 0..self.num_tasks {
            self.tasks.spawn(generate(
                Arc::clone(&self.base),
                self.config.clone(),
                self.timeout,
                task_index,
                signal.clone(),
            ));
        }

        let details = format!("tasks={}", self.num_tasks);
        log_source_operation("start", self.id(), KIND, "success", Some(&details));
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<Checkpoint> {
        self.tasks.shutdown(force).await;
        log_source_operation("stop", self.id(), KIND, "success", None);
        Ok(Checkpoint::none())
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

#[derive(Debug, Default)]
pub struct GeneratorEventSourceFactory;

impl EventSourceFactory for GeneratorEventSourceFactory {
    fn create(
        &self,
        id: &str,
        trigger: &TriggerConfig,
        worker_factory: &WorkerFactory,
    ) -> Result<Arc<dyn EventSource>> {
        let config: GeneratorConfig = trigger.typed_attributes(id)?;
        if config.min_delay_ms > config.max_delay_ms {
            return Err(DispatchError::Configuration(format!(
                "Trigger '{id}': min_delay_ms ({}) exceeds max_delay_ms ({})",
                config.min_delay_ms, config.max_delay_ms
            )));
        }

        let num_workers = trigger.worker_count(id, DEFAULT_NUM_WORKERS)?;
        let allocator = worker_factory.create_fixed_pool(num_workers)?;
        Ok(Arc::new(GeneratorEventSource::new(id, trigger, config, allocator)))
    }
}
