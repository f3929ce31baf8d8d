//! Runtimes with observable behavior.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use eventsource_core::event::Event;
use eventsource_core::runtime::{ProcessError, ProcessResult, Response, Runtime};

/// Records every body it sees and tracks peak concurrency. Bodies listed in
/// `failing` are rejected.
#[derive(Debug, Default)]
pub struct RecordingRuntime {
    delay: Duration,
    failing: HashSet<String>,
    seen: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_on(mut self, body: &str) -> Self {
        self.failing.insert(body.to_string());
        self
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runtime for RecordingRuntime {
    async fn process_event(&self, event: &Event) -> ProcessResult {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let body = event.body_str().unwrap_or_default().to_string();
        self.seen.lock().push(body.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&body) {
            Err(ProcessError::new(format!("rejected {body}")))
        } else {
            Ok(Response::Text(body))
        }
    }
}
