//! # Events
//!
//! The value object handed to a worker. Adapters fill in payload, headers and
//! source specific attributes; the submission helper stamps the event with the
//! identity of the source that produced it before it reaches user code.

pub mod pool;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::source::SourceInfo;

pub use pool::{EventPool, PooledEvent};

#[derive(Debug, Clone)]
pub struct Event {
    /// Transport supplied ID, or a generated UUID once submitted
    pub id: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub content_type: String,
    /// HTTP method for request events, empty otherwise
    pub method: String,
    /// Request path, subject, shard or item path depending on the source
    pub path: String,
    pub timestamp: DateTime<Utc>,
    /// Source specific fields (shard id, sequence number, item attributes, ...)
    pub attributes: serde_json::Map<String, serde_json::Value>,
    source: Weak<SourceInfo>,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            id: String::new(),
            body: Vec::new(),
            headers: HashMap::new(),
            content_type: String::new(),
            method: String::new(),
            path: String::new(),
            timestamp: Utc::now(),
            attributes: serde_json::Map::new(),
            source: Weak::new(),
        }
    }
}

impl Event {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// The source that produced this event, while it is still alive
    pub fn source_info(&self) -> Option<Arc<SourceInfo>> {
        self.source.upgrade()
    }

    pub(crate) fn set_source(&mut self, source: &Arc<SourceInfo>) {
        self.source = Arc::downgrade(source);
    }

    /// Clear all fields for reuse, keeping allocated buffers
    pub fn reset(&mut self) {
        self.id.clear();
        self.body.clear();
        self.headers.clear();
        self.content_type.clear();
        self.method.clear();
        self.path.clear();
        self.timestamp = Utc::now();
        self.attributes.clear();
        self.source = Weak::new();
    }
}
