//! # In-Memory Item Store
//!
//! Items are kept per directory in name order. A marker is the name of the
//! last item returned, so stamping items between pages never shifts a listing. Queries are recorded but not evaluated, except that an item stamped
//! with a checkpoint at or after its mtime is skipped when the query is
//! incremental, which is what the real store's filter amounts to.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::item_poller::{GetItemsRequest, GetItemsResponse, Item, ItemStore};
use crate::error::{DispatchError, Result};

type Attributes = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Default)]
pub struct InMemoryItemStore {
    directories: Mutex<BTreeMap<String, BTreeMap<String, Attributes>>>,
    requests: Mutex<Vec<GetItemsRequest>>,
    updates: Mutex<Vec<(String, Attributes)>>,
    failing_requests: AtomicUsize,
}

impl InMemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an item, stamping its mtime with the current time
    pub fn put_item(&self, directory: &str, name: &str, mut attributes: Attributes) {
        let now = Utc::now();
        attributes.insert("__name".to_string(), serde_json::Value::from(name));
        attributes.insert(
            "__mtime_secs".to_string(),
            serde_json::Value::from(now.timestamp()),
        );
        attributes.insert(
            "__mtime_nsecs".to_string(),
            serde_json::Value::from(now.timestamp_subsec_nanos()),
        );

        self.directories
            .lock()
            .entry(normalize(directory))
            .or_default()
            .insert(name.to_string(), attributes);
    }

    pub fn item(&self, path: &str) -> Option<Attributes> {
        let (directory, name) = split_path(path)?;
        self.directories
            .lock()
            .get(&directory)
            .and_then(|items| items.get(name))
            .cloned()
    }

    /// Make the next `count` listing requests fail
    pub fn fail_next_requests(&self, count: usize) {
        self.failing_requests.store(count, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<GetItemsRequest> {
        self.requests.lock().clone()
    }

    /// Every `update_item` call, in order
    pub fn updates(&self) -> Vec<(String, Attributes)> {
        self.updates.lock().clone()
    }
}

fn normalize(directory: &str) -> String {
    let trimmed = directory.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn split_path(path: &str) -> Option<(String, &str)> {
    let (directory, name) = path.rsplit_once('/')?;
    Some((normalize(directory), name))
}

fn pair(attributes: &Attributes, secs: &str, nsecs: &str) -> Option<(i64, i64)> {
    Some((
        attributes.get(secs)?.as_i64()?,
        attributes.get(nsecs)?.as_i64()?,
    ))
}

/// True if the item carries a checkpoint that is not older than its mtime
fn already_checkpointed(attributes: &Attributes, request: &GetItemsRequest) -> bool {
    let projected: Vec<&str> = request.attributes.split(',').collect();
    let Some(secs) = projected.iter().find(|a| a.starts_with("__eventsource_vip_") && a.ends_with("_secs")) else {
        return false;
    };
    let Some(nsecs) = projected.iter().find(|a| a.starts_with("__eventsource_vip_") && a.ends_with("_nsecs")) else {
        return false;
    };

    let Some(mtime) = pair(attributes, "__mtime_secs", "__mtime_nsecs") else {
        return false;
    };
    match pair(attributes, secs, nsecs) {
        Some(stamp) => mtime <= stamp,
        None => false,
    }
}

#[async_trait]
impl ItemStore for InMemoryItemStore {
    async fn get_items(&self, request: &GetItemsRequest) -> Result<GetItemsResponse> {
        self.requests.lock().push(request.clone());

        if self
            .failing_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DispatchError::Transport("Injected listing failure".to_string()));
        }

        let incremental = request.query.contains("__mtime_secs >");
        let directories = self.directories.lock();
        let Some(items) = directories.get(&normalize(&request.path)) else {
            return Ok(GetItemsResponse {
                items: Vec::new(),
                last_item_included: true,
                next_marker: String::new(),
            });
        };

        let after_marker = items.iter().filter(|(name, _)| {
            request.marker.is_empty() || name.as_str() > request.marker.as_str()
        });
        let mut matching = after_marker
            .filter(|(_, attributes)| !(incremental && already_checkpointed(attributes, request)))
            .map(|(name, attributes)| Item {
                name: name.clone(),
                attributes: attributes.clone(),
            });

        let page: Vec<Item> = matching.by_ref().take(request.limit).collect();
        let last_item_included = matching.next().is_none();
        let next_marker = page.last().map(|item| item.name.clone()).unwrap_or_default();

        Ok(GetItemsResponse {
            items: page,
            last_item_included,
            next_marker,
        })
    }

    async fn update_item(&self, path: &str, attributes: Attributes) -> Result<()> {
        self.updates
            .lock()
            .push((path.to_string(), attributes.clone()));

        let (directory, name) = split_path(path)
            .ok_or_else(|| DispatchError::Transport(format!("Invalid item path: {path}")))?;
        let mut directories = self.directories.lock();
        let item = directories
            .get_mut(&directory)
            .and_then(|items| items.get_mut(name))
            .ok_or_else(|| DispatchError::Transport(format!("Item not found: {path}")))?;

        item.extend(attributes);
        Ok(())
    }
}
