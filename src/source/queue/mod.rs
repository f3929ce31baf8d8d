//! # Message Queue Event Sources
//!
//! Asynchronous push triggers over a [`MessageBroker`]. The same listener loop
//! serves two kinds that differ only in pool policy and acknowledgement:
//!
//! | kind        | workers                        | listeners | ack                          |
//! |-------------|--------------------------------|-----------|------------------------------|
//! | `nats`      | fixed shareable, CPU count     | one per worker | never                   |
//! | `rabbit-mq` | singleton                      | one       | only after a successful submit |
//!
//! A delivery whose submission failed because no worker was available is left
//! unacknowledged so the broker can redeliver it; a delivery the function
//! rejected still counts as submitted and is acknowledged.

pub mod in_memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use super::{
    BaseEventSource, Checkpoint, EventSource, EventSourceFactory, ShutdownSignal, SourceClass,
    SourceTasks, SubmitOutcome,
};
use crate::config::{available_parallelism, TriggerConfig};
use crate::error::Result;
use crate::event::Event;
use crate::logging::log_source_operation;
use crate::statistics::SourceStatisticsSnapshot;
use crate::worker::{Worker, WorkerAllocator, WorkerFactory};

pub use in_memory::InMemoryBroker;

pub const NATS_KIND: &str = "nats";
pub const RABBIT_MQ_KIND: &str = "rabbit-mq";

/// How long a listener waits on the broker before re-checking for shutdown
const RECEIVE_WAIT: Duration = Duration::from_secs(1);

/// A message handed out by a broker
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker assigned ID, used for acknowledgement
    pub id: u64,
    pub topic: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub published_at: DateTime<Utc>,
}

/// Client side of a message broker connection
#[async_trait]
pub trait MessageBroker: Send + Sync + fmt::Debug {
    /// Wait up to `wait` for the next delivery on `topic`. Consumers sharing a
    /// `queue_group` split deliveries between them.
    async fn receive(
        &self,
        topic: &str,
        queue_group: Option<&str>,
        wait: Duration,
    ) -> Result<Option<Delivery>>;

    async fn ack(&self, topic: &str, delivery_id: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    Never,
    OnSubmitSuccess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Subject (nats) or routing key/queue (rabbit-mq) to consume
    pub topic: String,

    #[serde(default)]
    pub queue_name: Option<String>,
}

struct Listener {
    base: Arc<BaseEventSource>,
    broker: Arc<dyn MessageBroker>,
    config: QueueConfig,
    ack_policy: AckPolicy,
    timeout: Duration,
}

impl Listener {
    async fn run(self: Arc<Self>, listener_index: usize, mut shutdown: ShutdownSignal) {
        debug!(
            source_id = %self.base.id(),
            listener = listener_index,
            topic = %self.config.topic,
            "Queue listener started"
        );

        while !shutdown.is_triggered() {
            let received = tokio::select! {
                _ = shutdown.triggered() => break,
                received = self.broker.receive(
                    &self.config.topic,
                    self.config.queue_name.as_deref(),
                    RECEIVE_WAIT,
                ) => received,
            };

            match received {
                Ok(Some(delivery)) => self.handle(delivery).await,
                Ok(None) => {}
                Err(e) => {
                    error!(
                        source_id = %self.base.id(),
                        listener = listener_index,
                        error = %e,
                        "Failed to receive from broker"
                    );
                    if !shutdown.sleep(RECEIVE_WAIT).await {
                        break;
                    }
                }
            }
        }

        debug!(source_id = %self.base.id(), listener = listener_index, "Queue listener stopped");
    }

    async fn handle(&self, delivery: Delivery) {
        let mut event = Event::new(delivery.body)
            .with_path(delivery.topic.clone())
            .with_timestamp(delivery.published_at)
            .with_attribute("delivery_id", serde_json::Value::from(delivery.id));
        event.headers = delivery.headers;
        if let Some(content_type) = event.header("content-type").map(str::to_string) {
            event.content_type = content_type;
        }

        let submitted = match self.base.submit_event(&mut event, Some(self.timeout)).await {
            SubmitOutcome::NoWorker(err) => {
                warn!(
                    source_id = %self.base.id(),
                    delivery_id = delivery.id,
                    error = %err,
                    "Failed to submit delivery"
                );
                false
            }
            SubmitOutcome::Failed(err) => {
                debug!(
                    source_id = %self.base.id(),
                    delivery_id = delivery.id,
                    error = %err,
                    "Function failed on delivery"
                );
                true
            }
            SubmitOutcome::Completed(_) => true,
        };

        if submitted && self.ack_policy == AckPolicy::OnSubmitSuccess {
            if let Err(e) = self.broker.ack(&delivery.topic, delivery.id).await {
                warn!(
                    source_id = %self.base.id(),
                    delivery_id = delivery.id,
                    error = %e,
                    "Failed to ack delivery"
                );
            }
        }
    }
}

pub struct QueueEventSource {
    listener: Arc<Listener>,
    kind: &'static str,
    num_listeners: usize,
    tasks: SourceTasks,
}

impl QueueEventSource {
    pub fn new(
        id: &str,
        kind: &'static str,
        trigger: &TriggerConfig,
        config: QueueConfig,
        broker: Arc<dyn MessageBroker>,
        allocator: Arc<dyn WorkerAllocator>,
        ack_policy: AckPolicy,
    ) -> Self {
        let num_listeners = if allocator.shareable() {
            allocator.capacity().max(1)
        } else {
            1
        };

        let listener = Listener {
            base: Arc::new(BaseEventSource::new(id, kind, SourceClass::Async, allocator)),
            broker,
            config,
            ack_policy,
            timeout: trigger.worker_availability_timeout(),
        };

        Self {
            listener: Arc::new(listener),
            kind,
            num_listeners,
            tasks: SourceTasks::new(),
        }
    }

    pub fn ack_policy(&self) -> AckPolicy {
        self.listener.ack_policy
    }
}

#[async_trait]
impl EventSource for QueueEventSource {
    fn id(&self) -> &str {
        self.listener.base.id()
    }

    fn class(&self) -> SourceClass {
        SourceClass::Async
    }

    fn kind(&self) -> &str {
        self.kind
    }

    #[instrument(skip(self, _checkpoint), fields(source_id = %self.id(), kind = %self.kind))]
    async fn start(&self, _checkpoint: Checkpoint) -> Result<()> {
        let signal = self.tasks.begin()?;

        for index in 0..self.num_listeners {
            self.tasks
                .spawn(Arc::clone(&self.listener).run(index, signal.clone()));
        }

        let details = format!(
            "topic={} listeners={}",
            self.listener.config.topic, self.num_listeners
        );
        log_source_operation("start", self.id(), self.kind, "success", Some(&details));
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<Checkpoint> {
        self.tasks.shutdown(force).await;
        log_source_operation("stop", self.id(), self.kind, "success", None);
        Ok(Checkpoint::none())
    }

    fn statistics(&self) -> SourceStatisticsSnapshot {
        self.listener.base.statistics()
    }

    fn workers(&self) -> Vec<Arc<Worker>> {
        self.listener.base.workers()
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({
            "topic": self.listener.config.topic,
            "queue_name": self.listener.config.queue_name,
            "ack_policy": self.listener.ack_policy,
            "listeners": self.num_listeners,
        })
    }
}

/// `nats` triggers bound to one broker connection
#[derive(Debug, Clone)]
pub struct NatsEventSourceFactory {
    broker: Arc<dyn MessageBroker>,
}

impl NatsEventSourceFactory {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }
}

impl EventSourceFactory for NatsEventSourceFactory {
    fn create(
        &self,
        id: &str,
        trigger: &TriggerConfig,
        worker_factory: &WorkerFactory,
    ) -> Result<Arc<dyn EventSource>> {
        let config: QueueConfig = trigger.typed_attributes(id)?;
        let num_workers = trigger.worker_count(id, available_parallelism())?;
        let allocator = worker_factory.create_fixed_pool(num_workers)?;

        Ok(Arc::new(QueueEventSource::new(
            id,
            NATS_KIND,
            trigger,
            config,
            Arc::clone(&self.broker),
            allocator,
            AckPolicy::Never,
        )))
    }
}

/// `rabbit-mq` triggers bound to one broker connection
#[derive(Debug, Clone)]
pub struct RabbitMqEventSourceFactory {
    broker: Arc<dyn MessageBroker>,
}

impl RabbitMqEventSourceFactory {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }
}

impl EventSourceFactory for RabbitMqEventSourceFactory {
    fn create(
        &self,
        id: &str,
        trigger: &TriggerConfig,
        worker_factory: &WorkerFactory,
    ) -> Result<Arc<dyn EventSource>> {
        let config: QueueConfig = trigger.typed_attributes(id)?;
        let allocator = worker_factory.create_singleton()?;

        Ok(Arc::new(QueueEventSource::new(
            id,
            RABBIT_MQ_KIND,
            trigger,
            config,
            Arc::clone(&self.broker),
            allocator,
            AckPolicy::OnSubmitSuccess,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::EchoRuntimeFactory;
    use serde_json::json;

    fn worker_factory() -> WorkerFactory {
        WorkerFactory::new(Arc::new(EchoRuntimeFactory), RuntimeConfig::default())
    }

    #[test]
    fn test_topic_is_required() {
        let broker = Arc::new(InMemoryBroker::new());
        let result = NatsEventSourceFactory::new(broker).create(
            "orders",
            &TriggerConfig::new(NATS_KIND),
            &worker_factory(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_nats_pool_follows_num_workers() {
        let broker = Arc::new(InMemoryBroker::new());
        let trigger = TriggerConfig::new(NATS_KIND)
            .with_num_workers(3)
            .with_attribute("topic", json!("orders"));

        let source = NatsEventSourceFactory::new(broker)
            .create("orders", &trigger, &worker_factory())
            .unwrap();

        assert_eq!(source.workers().len(), 3);
        assert_eq!(source.config()["listeners"], json!(3));
        assert_eq!(source.config()["ack_policy"], json!("never"));
    }

    #[test]
    fn test_rabbit_uses_singleton() {
        let broker = Arc::new(InMemoryBroker::new());
        let trigger = TriggerConfig::new(RABBIT_MQ_KIND)
            .with_num_workers(8)
            .with_attribute("topic", json!("jobs"));

        let source = RabbitMqEventSourceFactory::new(broker)
            .create("jobs", &trigger, &worker_factory())
            .unwrap();

        assert_eq!(source.kind(), RABBIT_MQ_KIND);
        assert_eq!(source.workers().len(), 1);
        assert_eq!(source.config()["ack_policy"], json!("on_submit_success"));
    }
}
