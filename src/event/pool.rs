//! # Event Pool
//!
//! Fixed-capacity set of reusable [`Event`] objects for high-rate synchronous
//! adapters. `get` waits while every event is checked out, so the pool size also
//! caps how many requests an adapter has in flight, independently of the size
//! of its worker pool.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::Event;
use crate::pool::BoundedPool;

#[derive(Debug)]
pub struct EventPool {
    pool: BoundedPool<Event>,
}

impl EventPool {
    pub fn new(capacity: usize) -> Self {
        let events = (0..capacity).map(|_| Event::default()).collect();
        Self {
            pool: BoundedPool::new("events", events),
        }
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn available(&self) -> usize {
        self.pool.available()
    }

    /// Borrow an event, waiting until one is free. The event goes back to the
    /// pool when the returned guard is dropped.
    pub async fn get(self: &Arc<Self>) -> PooledEvent {
        // acquire without a timeout only fails once the semaphore is closed,
        // which this pool never does
        let event = match self.pool.acquire(None).await {
            Ok(event) => event,
            Err(_) => Event::default(),
        };

        PooledEvent {
            pool: Arc::clone(self),
            event,
        }
    }

    /// Borrow an event only if one is free right now
    pub fn try_get(self: &Arc<Self>) -> Option<PooledEvent> {
        self.pool.try_acquire().map(|event| PooledEvent {
            pool: Arc::clone(self),
            event,
        })
    }

    /// Return an event for reuse
    pub fn put(&self, mut event: Event) {
        event.reset();
        self.pool.release(event);
    }
}

/// An event checked out of an [`EventPool`]
#[derive(Debug)]
pub struct PooledEvent {
    pool: Arc<EventPool>,
    event: Event,
}

impl Deref for PooledEvent {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.event
    }
}

impl DerefMut for PooledEvent {
    fn deref_mut(&mut self) -> &mut Event {
        &mut self.event
    }
}

impl Drop for PooledEvent {
    fn drop(&mut self) {
        let event = std::mem::take(&mut self.event);
        self.pool.put(event);
    }
}
