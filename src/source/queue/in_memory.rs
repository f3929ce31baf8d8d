//! # In-Memory Message Broker
//!
//! Thread-safe broker for tests and demos. Every consumer of a topic competes
//! for the same FIFO queue, so queue groups are implied. Received deliveries
//! stay tracked as unacknowledged until acked.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::{Delivery, MessageBroker};
use crate::error::{DispatchError, Result};

#[derive(Debug, Default)]
struct InMemoryTopic {
    pending: Mutex<VecDeque<Delivery>>,
    unacked: Mutex<HashMap<u64, Delivery>>,
    notify: Notify,
    total_published: AtomicU64,
    total_acked: AtomicU64,
}

impl InMemoryTopic {
    fn take_next(&self) -> Option<Delivery> {
        let delivery = self.pending.lock().pop_front()?;
        self.unacked.lock().insert(delivery.id, delivery.clone());
        Some(delivery)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBroker {
    topics: DashMap<String, Arc<InMemoryTopic>>,
    next_id: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, name: &str) -> Arc<InMemoryTopic> {
        self.topics
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub fn publish(&self, topic: &str, body: impl Into<Vec<u8>>) -> u64 {
        self.publish_with_headers(topic, body, HashMap::new())
    }

    pub fn publish_with_headers(
        &self,
        topic: &str,
        body: impl Into<Vec<u8>>,
        headers: HashMap<String, String>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let state = self.topic(topic);

        state.pending.lock().push_back(Delivery {
            id,
            topic: topic.to_string(),
            body: body.into(),
            headers,
            published_at: Utc::now(),
        });
        state.total_published.fetch_add(1, Ordering::Relaxed);
        state.notify.notify_one();
        id
    }

    /// Deliveries not yet handed to a consumer
    pub fn pending_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|t| t.pending.lock().len())
            .unwrap_or(0)
    }

    /// Deliveries handed out but never acknowledged
    pub fn unacked_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|t| t.unacked.lock().len())
            .unwrap_or(0)
    }

    pub fn acked_count(&self, topic: &str) -> u64 {
        self.topics
            .get(topic)
            .map(|t| t.total_acked.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn receive(
        &self,
        topic: &str,
        _queue_group: Option<&str>,
        wait: Duration,
    ) -> Result<Option<Delivery>> {
        let state = self.topic(topic);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if let Some(delivery) = state.take_next() {
                // wake the next competing consumer if more is queued
                if !state.pending.lock().is_empty() {
                    state.notify.notify_one();
                }
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, state.notify.notified())
                .await
                .is_err()
            {
                return Ok(state.take_next());
            }
        }
    }

    async fn ack(&self, topic: &str, delivery_id: u64) -> Result<()> {
        let state = self
            .topics
            .get(topic)
            .map(|t| t.value().clone())
            .ok_or_else(|| DispatchError::Transport(format!("Unknown topic: {topic}")))?;

        if state.unacked.lock().remove(&delivery_id).is_none() {
            return Err(DispatchError::Transport(format!(
                "Delivery {delivery_id} is not awaiting ack on {topic}"
            )));
        }
        state.total_acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_then_receive() {
        let broker = InMemoryBroker::new();
        let id = broker.publish("orders", "one");

        let delivery = broker
            .receive("orders", None, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(delivery.id, id);
        assert_eq!(delivery.body, b"one");
        assert_eq!(broker.pending_count("orders"), 0);
        assert_eq!(broker.unacked_count("orders"), 1);

        broker.ack("orders", id).await.unwrap();
        assert_eq!(broker.unacked_count("orders"), 0);
        assert_eq!(broker.acked_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_receive_times_out_when_empty() {
        let broker = InMemoryBroker::new();
        let received = broker
            .receive("empty", None, Duration::from_millis(5))
            .await
            .unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_waiting_consumer_is_woken() {
        let broker = Arc::new(InMemoryBroker::new());

        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .receive("late", None, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.publish("late", "hello");

        let delivery = consumer.await.unwrap().unwrap();
        assert_eq!(delivery.body, b"hello");
    }

    #[tokio::test]
    async fn test_double_ack_fails() {
        let broker = InMemoryBroker::new();
        let id = broker.publish("orders", "one");
        broker
            .receive("orders", None, Duration::ZERO)
            .await
            .unwrap();

        broker.ack("orders", id).await.unwrap();
        assert!(broker.ack("orders", id).await.is_err());
    }
}
