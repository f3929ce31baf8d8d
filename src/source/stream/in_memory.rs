//! # In-Memory Shard Stream
//!
//! Each shard is an append-only vector of records and a position is the index
//! of the next record to read. Fetch failures can be injected to exercise the
//! retry path.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{Record, RecordBatch, ShardClient};
use crate::error::{DispatchError, Result};

#[derive(Debug, Default)]
pub struct InMemoryStream {
    shards: DashMap<String, Arc<Mutex<Vec<Record>>>>,
    next_sequence: AtomicU64,
    failing_fetches: AtomicUsize,
    fetches: Mutex<Vec<(String, String)>>,
}

impl InMemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, shard_id: &str) -> Arc<Mutex<Vec<Record>>> {
        self.shards
            .entry(shard_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Append a record and return its sequence number
    pub fn put_record(
        &self,
        shard_id: &str,
        partition_key: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> String {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let sequence_number = format!("{sequence:020}");

        self.shard(shard_id).lock().push(Record {
            sequence_number: sequence_number.clone(),
            partition_key: partition_key.into(),
            data: data.into(),
            arrived_at: Utc::now(),
        });
        sequence_number
    }

    /// Make the next `count` fetches fail
    pub fn fail_next_fetches(&self, count: usize) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// Every (shard, position) pair fetched so far, failed fetches included
    pub fn fetches(&self) -> Vec<(String, String)> {
        self.fetches.lock().clone()
    }
}

#[async_trait]
impl ShardClient for InMemoryStream {
    async fn initial_position(
        &self,
        _stream_name: &str,
        shard_id: &str,
        after_sequence: Option<&str>,
    ) -> Result<String> {
        let Some(sequence) = after_sequence else {
            return Ok("0".to_string());
        };

        let shard = self.shard(shard_id);
        let records = shard.lock();
        records
            .iter()
            .position(|record| record.sequence_number == sequence)
            .map(|index| (index + 1).to_string())
            .ok_or_else(|| {
                DispatchError::Transport(format!(
                    "Sequence number {sequence} not found in shard {shard_id}"
                ))
            })
    }

    async fn get_records(
        &self,
        _stream_name: &str,
        shard_id: &str,
        position: &str,
        limit: usize,
    ) -> Result<RecordBatch> {
        self.fetches
            .lock()
            .push((shard_id.to_string(), position.to_string()));

        let failing = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(DispatchError::Transport(
                "Injected fetch failure".to_string(),
            ));
        }

        let start: usize = position
            .parse()
            .map_err(|_| DispatchError::Transport(format!("Invalid position: {position}")))?;

        let shard = self.shard(shard_id);
        let records = shard.lock();
        let start = start.min(records.len());
        let end = (start + limit).min(records.len());

        Ok(RecordBatch {
            records: records[start..end].to_vec(),
            next_position: end.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_in_order_with_limit() {
        let stream = InMemoryStream::new();
        for i in 0..3 {
            stream.put_record("s0", "key", format!("r{i}"));
        }

        let position = stream.initial_position("st", "s0", None).await.unwrap();
        let batch = stream.get_records("st", "s0", &position, 2).await.unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].data, b"r0");

        let batch = stream
            .get_records("st", "s0", &batch.next_position, 2)
            .await
            .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].data, b"r2");
    }

    #[tokio::test]
    async fn test_resume_after_sequence() {
        let stream = InMemoryStream::new();
        let first = stream.put_record("s0", "key", "a");
        stream.put_record("s0", "key", "b");

        let position = stream
            .initial_position("st", "s0", Some(first.as_str()))
            .await
            .unwrap();
        let batch = stream.get_records("st", "s0", &position, 10).await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].data, b"b");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let stream = InMemoryStream::new();
        stream.fail_next_fetches(2);

        assert!(stream.get_records("st", "s0", "0", 1).await.is_err());
        assert!(stream.get_records("st", "s0", "0", 1).await.is_err());
        assert!(stream.get_records("st", "s0", "0", 1).await.is_ok());
        assert_eq!(stream.fetches().len(), 3);
    }
}
