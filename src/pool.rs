//! # Bounded Resource Pool
//!
//! A fixed set of pre-created items guarded by a capacity semaphore. Both the
//! worker allocators and the event pool are thin layers over this type.
//!
//! The semaphore holds exactly one permit per idle item. `acquire` consumes a
//! permit before popping an item and `release` pushes the item back before
//! returning the permit, so the number of items handed out can never exceed the
//! pool's capacity and no item is ever handed to two holders at once.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{DispatchError, Result};

#[derive(Debug)]
pub struct BoundedPool<T> {
    name: String,
    capacity: usize,
    available: Semaphore,
    idle: Mutex<Vec<T>>,
}

impl<T> BoundedPool<T> {
    pub fn new(name: impl Into<String>, items: Vec<T>) -> Self {
        let capacity = items.len();
        Self {
            name: name.into(),
            capacity,
            available: Semaphore::new(capacity),
            idle: Mutex::new(items),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of idle items right now
    pub fn available(&self) -> usize {
        self.available.available_permits()
    }

    /// Take an item out of the pool.
    ///
    /// - `None` waits until an item is released
    /// - `Some(Duration::ZERO)` fails immediately if the pool is exhausted
    /// - `Some(timeout)` waits up to `timeout`
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<T> {
        let permit = match timeout {
            None => self
                .available
                .acquire()
                .await
                .map_err(|_| DispatchError::InvalidState(format!("Pool {} is closed", self.name)))?,
            Some(timeout) if timeout.is_zero() => self
                .available
                .try_acquire()
                .map_err(|_| DispatchError::NoAvailableWorkers)?,
            Some(timeout) => match tokio::time::timeout(timeout, self.available.acquire()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(DispatchError::InvalidState(format!(
                        "Pool {} is closed",
                        self.name
                    )))
                }
                Err(_) => return Err(DispatchError::allocation_timeout(timeout)),
            },
        };

        // the permit is handed back explicitly in release()
        permit.forget();

        match self.idle.lock().pop() {
            Some(item) => Ok(item),
            None => {
                self.available.add_permits(1);
                Err(DispatchError::Internal(format!(
                    "Pool {} granted a permit with no idle item",
                    self.name
                )))
            }
        }
    }

    /// Take an item only if one is idle right now
    pub fn try_acquire(&self) -> Option<T> {
        let permit = self.available.try_acquire().ok()?;
        let item = self.idle.lock().pop();
        match item {
            Some(item) => {
                permit.forget();
                Some(item)
            }
            None => None,
        }
    }

    /// Return an item to the pool
    pub fn release(&self, item: T) {
        self.release_unless_idle(item, |_, _| false);
    }

    /// Return an item unless `same` matches one already idle, in which case
    /// the item was released twice and is dropped. Returns whether it was kept.
    pub fn release_unless_idle(&self, item: T, same: impl Fn(&T, &T) -> bool) -> bool {
        {
            let mut idle = self.idle.lock();
            if idle.iter().any(|held| same(held, &item)) {
                warn!(pool = %self.name, "Item released twice, dropping duplicate");
                return false;
            }
            if idle.len() >= self.capacity {
                warn!(
                    pool = %self.name,
                    capacity = self.capacity,
                    "Released more items than the pool holds, dropping item"
                );
                return false;
            }
            idle.push(item);
        }
        self.available.add_permits(1);
        true
    }
}
