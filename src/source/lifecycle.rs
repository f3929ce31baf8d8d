//! # Source Task Lifecycle
//!
//! Background tasks spawned by a source observe a [`ShutdownSignal`] at every
//! fetch, sleep and submit boundary. [`SourceTasks`] owns the signal's sender
//! and the task handles: a graceful shutdown lets each task finish its current
//! iteration, a forced one aborts them.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown has been requested
    pub async fn triggered(&mut self) {
        // a dropped sender also means the source is gone
        let _ = self.receiver.wait_for(|stop| *stop).await;
    }

    /// Sleep for `duration` unless shutdown arrives first. Returns `true` if
    /// the full duration elapsed.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.triggered() => false,
        }
    }
}

#[derive(Debug)]
pub struct SourceTasks {
    shutdown: Mutex<watch::Sender<bool>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Default for SourceTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceTasks {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            shutdown: Mutex::new(sender),
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Mark the source as running and hand out a fresh shutdown signal.
    /// Fails if the source is already running.
    pub fn begin(&self) -> Result<ShutdownSignal> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DispatchError::InvalidState(
                "Event source is already running".to_string(),
            ));
        }

        let (sender, receiver) = watch::channel(false);
        *self.shutdown.lock() = sender;
        Ok(ShutdownSignal { receiver })
    }

    /// A signal tied to the current run
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.shutdown.lock().subscribe(),
        }
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.handles.lock().push(handle);
    }

    /// Signal every task to stop. With `force` the tasks are aborted,
    /// otherwise each is awaited.
    pub async fn shutdown(&self, force: bool) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.shutdown.lock().send_replace(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());

        debug!(tasks = handles.len(), force = force, "Shutting down source tasks");

        if force {
            for handle in &handles {
                handle.abort();
            }
        }

        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                if !err.is_cancelled() {
                    warn!(error = %err, "Source task ended abnormally");
                }
            }
        }
    }
}
