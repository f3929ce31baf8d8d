//! Item poller cycles against the in-memory item store.

mod common;

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

use common::shared_runtime_factory;
use eventsource_core::runtime::{FnRuntime, ProcessError, ProcessResult, Response};
use eventsource_core::source::poller::item_poller::KIND;
use eventsource_core::source::poller::{InMemoryItemStore, ItemPollerFactory};
use eventsource_core::{Checkpoint, Event, EventSourceFactory, TriggerConfig};

fn poller_trigger(extra: serde_json::Value) -> TriggerConfig {
    let mut trigger = common::trigger(KIND)
        .with_num_workers(1)
        .with_attribute("paths", json!(["/data"]))
        .with_attribute("interval_ms", json!(20))
        .with_attribute("max_batch_size", json!(10));
    if let serde_json::Value::Object(extra) = extra {
        trigger.attributes.extend(extra);
    }
    trigger
}

/// Runtime that records item paths and fails every item whose path ends
/// with `failing_suffix`
fn path_recorder(
    failing_suffix: &'static str,
) -> (Arc<Mutex<Vec<String>>>, Arc<dyn eventsource_core::Runtime>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let runtime = FnRuntime::new({
        let seen = seen.clone();
        move |event: &Event| -> ProcessResult {
            seen.lock().push(event.path.clone());
            if event.path.ends_with(failing_suffix) {
                Err(ProcessError::new("refused"))
            } else {
                Ok(Response::Empty)
            }
        }
    });
    (seen, Arc::new(runtime))
}

fn count(seen: &Mutex<Vec<String>>, path: &str) -> usize {
    seen.lock().iter().filter(|p| p.as_str() == path).count()
}

#[tokio::test]
async fn test_failed_item_is_polled_again_successes_are_not() {
    let store = Arc::new(InMemoryItemStore::new());
    for name in ["a.csv", "b.csv", "c.csv"] {
        store.put_item("/data", name, serde_json::Map::new());
    }

    let (seen, runtime) = path_recorder("b.csv");
    let source = ItemPollerFactory::new(store.clone())
        .create("items", &poller_trigger(json!({})), &shared_runtime_factory(runtime))
        .unwrap();

    source.start(Checkpoint::none()).await.unwrap();
    assert!(common::eventually(|| count(&seen, "/data/b.csv") >= 3).await);
    let checkpoint = source.stop(false).await.unwrap();

    assert!(checkpoint.is_none());
    assert_eq!(count(&seen, "/data/a.csv"), 1);
    assert_eq!(count(&seen, "/data/c.csv"), 1);

    // only the two successes were stamped, once each
    let mut stamped: Vec<String> = store.updates().into_iter().map(|(path, _)| path).collect();
    stamped.sort();
    assert_eq!(stamped, vec!["/data/a.csv", "/data/c.csv"]);

    let a = store.item("/data/a.csv").unwrap();
    assert_eq!(a["__eventsource_vip_items_secs"], a["__mtime_secs"]);
    assert_eq!(a["__eventsource_vip_items_nsecs"], a["__mtime_nsecs"]);
    let b = store.item("/data/b.csv").unwrap();
    assert!(!b.contains_key("__eventsource_vip_items_secs"));

    let stats = source.statistics();
    assert_eq!(stats.events_handled_success_total, 2);
    assert!(stats.events_handled_failure_total >= 3);
    assert_eq!(stats.allocation_failures_total, 0);
}

#[tokio::test]
async fn test_query_goes_incremental_after_first_cycle() {
    let store = Arc::new(InMemoryItemStore::new());
    store.put_item("/data", "report.csv", serde_json::Map::new());

    let (_seen, runtime) = path_recorder("never");
    let trigger = poller_trigger(json!({
        "suffixes": [".csv", ".json"],
        "queries": ["__size > 0"],
        "attributes": ["owner"],
    }));
    let source = ItemPollerFactory::new(store.clone())
        .create("reports", &trigger, &shared_runtime_factory(runtime))
        .unwrap();

    source.start(Checkpoint::none()).await.unwrap();
    assert!(common::eventually(|| store.requests().len() >= 2).await);
    source.stop(false).await.unwrap();

    let requests = store.requests();
    assert_eq!(
        requests[0].query,
        "(ends(__name, '.csv') or ends(__name, '.json')) and (__size > 0)"
    );
    assert_eq!(
        requests[1].query,
        "(__mtime_secs > __eventsource_vip_reports_secs or \
         (__mtime_secs == __eventsource_vip_reports_secs and \
         __mtime_nsecs > __eventsource_vip_reports_nsecs)) and \
         (ends(__name, '.csv') or ends(__name, '.json')) and (__size > 0)"
    );
    assert_eq!(
        requests[0].attributes,
        "__name,__mtime_secs,__mtime_nsecs,__obj_type,__size,\
         __eventsource_vip_reports_secs,__eventsource_vip_reports_nsecs,owner"
    );
}

#[tokio::test]
async fn test_non_incremental_poller_keeps_full_listing() {
    let store = Arc::new(InMemoryItemStore::new());
    store.put_item("/data", "a.csv", serde_json::Map::new());

    let (seen, runtime) = path_recorder("never");
    let source = ItemPollerFactory::new(store.clone())
        .create(
            "full",
            &poller_trigger(json!({"incremental": false})),
            &shared_runtime_factory(runtime),
        )
        .unwrap();

    source.start(Checkpoint::none()).await.unwrap();
    assert!(common::eventually(|| count(&seen, "/data/a.csv") >= 2).await);
    source.stop(false).await.unwrap();

    assert!(store.requests().iter().all(|r| r.query.is_empty()));
}

#[tokio::test]
async fn test_listing_failure_is_retried_at_same_marker() {
    let store = Arc::new(InMemoryItemStore::new());
    store.put_item("/data", "a.csv", serde_json::Map::new());
    store.fail_next_requests(2);

    let (seen, runtime) = path_recorder("never");
    let source = ItemPollerFactory::new(store.clone())
        .create("retry", &poller_trigger(json!({})), &shared_runtime_factory(runtime))
        .unwrap();

    source.start(Checkpoint::none()).await.unwrap();
    assert!(common::eventually(|| count(&seen, "/data/a.csv") == 1).await);
    source.stop(false).await.unwrap();

    let requests = store.requests();
    assert!(requests.len() >= 3);
    assert!(requests[..3].iter().all(|r| r.marker.is_empty()));
}

#[test]
fn test_invalid_configuration_is_rejected() {
    let store = Arc::new(InMemoryItemStore::new());
    let (_seen, runtime) = path_recorder("never");
    let factory = ItemPollerFactory::new(store);

    let no_paths = common::trigger(KIND);
    assert!(factory
        .create("items", &no_paths, &shared_runtime_factory(runtime.clone()))
        .is_err());

    let bad_shard = poller_trigger(json!({"shard_id": 2, "total_shards": 2}));
    assert!(factory
        .create("items", &bad_shard, &shared_runtime_factory(runtime))
        .is_err());
}
