//! HTTP trigger over a real socket.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{workers_with, RecordingRuntime};
use eventsource_core::config::TriggerConfig;
use eventsource_core::source::http::{HttpConfig, HttpEventSource};
use eventsource_core::worker::FixedPoolWorkerAllocator;
use eventsource_core::{Checkpoint, EventSource};

fn http_source(runtime: Arc<RecordingRuntime>, workers: usize, timeout_ms: u64) -> HttpEventSource {
    let mut trigger = TriggerConfig::new("http");
    trigger.worker_availability_timeout_ms = timeout_ms;

    HttpEventSource::new(
        "web",
        &trigger,
        HttpConfig {
            listen_address: "127.0.0.1:0".to_string(),
            max_in_flight: 8,
        },
        Arc::new(FixedPoolWorkerAllocator::new(workers_with(runtime, workers))),
    )
}

/// Send one request with `Connection: close` and return the raw response
async fn post(source: &HttpEventSource, path: &str, body: &str) -> String {
    let address = source.local_addr().expect("source is listening");
    let mut stream = TcpStream::connect(address).await.unwrap();

    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_request_round_trip() {
    let runtime = Arc::new(RecordingRuntime::new());
    let source = http_source(runtime.clone(), 2, 1_000);

    source.start(Checkpoint::none()).await.unwrap();
    let response = post(&source, "/greet", "hello").await;
    source.stop(false).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.contains("content-type: text/plain; charset=utf-8"));
    assert!(response.ends_with("hello"));
    assert_eq!(runtime.seen(), vec!["hello"]);
    assert!(source.local_addr().is_none());
}

#[tokio::test]
async fn test_function_error_maps_to_500() {
    let runtime = Arc::new(RecordingRuntime::new().failing_on("boom"));
    let source = http_source(runtime, 1, 1_000);

    source.start(Checkpoint::none()).await.unwrap();
    let response = post(&source, "/", "boom").await;
    source.stop(false).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 500"), "{response}");
    assert!(response.ends_with("rejected boom"));
    assert_eq!(source.statistics().events_handled_failure_total, 1);
}

#[tokio::test]
async fn test_busy_workers_map_to_503() {
    let runtime = Arc::new(RecordingRuntime::new().with_delay(Duration::from_millis(300)));
    let source = Arc::new(http_source(runtime.clone(), 1, 20));

    source.start(Checkpoint::none()).await.unwrap();

    let slow = {
        let source = source.clone();
        tokio::spawn(async move { post(&source, "/slow", "slow").await })
    };
    assert!(common::eventually(|| runtime.peak_in_flight() == 1).await);

    let rejected = post(&source, "/fast", "fast").await;
    let slow = slow.await.unwrap();
    source.stop(false).await.unwrap();

    assert!(rejected.starts_with("HTTP/1.1 503"), "{rejected}");
    assert!(slow.starts_with("HTTP/1.1 200"), "{slow}");
    assert_eq!(source.statistics().allocation_failures_total, 1);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let source = http_source(Arc::new(RecordingRuntime::new()), 1, 1_000);

    source.start(Checkpoint::none()).await.unwrap();
    assert!(source.start(Checkpoint::none()).await.is_err());
    source.stop(true).await.unwrap();
}

#[tokio::test]
async fn test_exclusive_pool_is_refused() {
    let trigger = TriggerConfig::new("http");
    let source = HttpEventSource::new(
        "web",
        &trigger,
        HttpConfig {
            listen_address: "127.0.0.1:0".to_string(),
            max_in_flight: 1,
        },
        Arc::new(FixedPoolWorkerAllocator::exclusive(workers_with(
            Arc::new(RecordingRuntime::new()),
            1,
        ))),
    );

    assert!(source.start(Checkpoint::none()).await.is_err());
}
