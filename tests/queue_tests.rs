//! Queue listeners against the in-memory broker.

mod common;

use serde_json::json;
use std::sync::Arc;

use common::{shared_runtime_factory, RecordingRuntime};
use eventsource_core::source::queue::{
    AckPolicy, InMemoryBroker, NatsEventSourceFactory, QueueConfig, QueueEventSource,
    RabbitMqEventSourceFactory, NATS_KIND, RABBIT_MQ_KIND,
};
use eventsource_core::worker::FixedPoolWorkerAllocator;
use eventsource_core::{Checkpoint, EventSource, EventSourceFactory, TriggerConfig};

fn queue_trigger(kind: &str) -> TriggerConfig {
    common::trigger(kind).with_attribute("topic", json!("orders"))
}

#[tokio::test]
async fn test_rabbit_mq_acks_every_processed_delivery() {
    let broker = Arc::new(InMemoryBroker::new());
    for body in ["one", "bad", "three"] {
        broker.publish("orders", body);
    }

    let runtime = Arc::new(RecordingRuntime::new().failing_on("bad"));
    let source = RabbitMqEventSourceFactory::new(broker.clone())
        .create(
            "orders",
            &queue_trigger(RABBIT_MQ_KIND),
            &shared_runtime_factory(runtime.clone()),
        )
        .unwrap();
    assert_eq!(source.workers().len(), 1);

    source.start(Checkpoint::none()).await.unwrap();
    assert!(common::eventually(|| broker.acked_count("orders") == 3).await);
    assert!(source.stop(false).await.unwrap().is_none());

    // a function error still consumes the delivery
    assert_eq!(broker.unacked_count("orders"), 0);
    assert_eq!(broker.pending_count("orders"), 0);
    assert_eq!(runtime.seen(), vec!["one", "bad", "three"]);

    let stats = source.statistics();
    assert_eq!(stats.events_handled_success_total, 2);
    assert_eq!(stats.events_handled_failure_total, 1);
}

#[tokio::test]
async fn test_delivery_without_worker_is_not_acked() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.publish("orders", "stranded");

    let mut trigger = queue_trigger(RABBIT_MQ_KIND);
    trigger.worker_availability_timeout_ms = 0;
    let source = QueueEventSource::new(
        "orders",
        RABBIT_MQ_KIND,
        &trigger,
        QueueConfig {
            topic: "orders".to_string(),
            queue_name: None,
        },
        broker.clone(),
        Arc::new(FixedPoolWorkerAllocator::new(Vec::new())),
        AckPolicy::OnSubmitSuccess,
    );

    source.start(Checkpoint::none()).await.unwrap();
    assert!(common::eventually(|| source.statistics().allocation_failures_total == 1).await);
    source.stop(false).await.unwrap();

    assert_eq!(broker.acked_count("orders"), 0);
    assert_eq!(broker.unacked_count("orders"), 1);
}

#[tokio::test]
async fn test_nats_never_acks() {
    let broker = Arc::new(InMemoryBroker::new());
    for i in 0..5 {
        broker.publish("orders", format!("msg-{i}"));
    }

    let runtime = Arc::new(RecordingRuntime::new());
    let source = NatsEventSourceFactory::new(broker.clone())
        .create(
            "subjects",
            &queue_trigger(NATS_KIND).with_num_workers(3),
            &shared_runtime_factory(runtime.clone()),
        )
        .unwrap();
    assert_eq!(source.workers().len(), 3);
    assert_eq!(source.config()["listeners"], json!(3));
    assert_eq!(source.config()["ack_policy"], json!("never"));

    source.start(Checkpoint::none()).await.unwrap();
    assert!(common::eventually(|| runtime.seen_count() == 5).await);
    source.stop(false).await.unwrap();

    assert_eq!(broker.acked_count("orders"), 0);
    assert_eq!(broker.unacked_count("orders"), 5);

    let mut seen = runtime.seen();
    seen.sort();
    let expected: Vec<String> = (0..5).map(|i| format!("msg-{i}")).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_headers_reach_the_function() {
    let broker = Arc::new(InMemoryBroker::new());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let runtime = eventsource_core::runtime::FnRuntime::new({
        let seen = seen.clone();
        move |event: &eventsource_core::Event| -> eventsource_core::ProcessResult {
            seen.lock().push((event.content_type.clone(), event.path.clone()));
            Ok(eventsource_core::Response::Empty)
        }
    });

    let source = NatsEventSourceFactory::new(broker.clone())
        .create(
            "subjects",
            &queue_trigger(NATS_KIND).with_num_workers(1),
            &shared_runtime_factory(Arc::new(runtime)),
        )
        .unwrap();
    source.start(Checkpoint::none()).await.unwrap();

    let headers = [("Content-Type".to_string(), "application/json".to_string())]
        .into_iter()
        .collect();
    broker.publish_with_headers("orders", "{}", headers);

    assert!(common::eventually(|| !seen.lock().is_empty()).await);
    source.stop(false).await.unwrap();

    assert_eq!(
        seen.lock()[0],
        ("application/json".to_string(), "orders".to_string())
    );
}

#[test]
fn test_missing_topic_is_rejected() {
    let broker = Arc::new(InMemoryBroker::new());
    let runtime = Arc::new(RecordingRuntime::new());

    let result = RabbitMqEventSourceFactory::new(broker).create(
        "orders",
        &common::trigger(RABBIT_MQ_KIND),
        &shared_runtime_factory(runtime),
    );
    assert!(result.is_err());
}
