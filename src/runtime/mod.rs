//! # Function Runtime Capability
//!
//! The dispatch core never runs user code itself; it hands events to a
//! [`Runtime`] through a worker. This module defines that capability, the
//! response and error shapes a runtime may return, and the factory used to
//! build one runtime instance per worker.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::event::Event;

/// What a function returned
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// A full response description. `None` fields keep the adapter's defaults.
    Structured {
        status_code: Option<u16>,
        headers: HashMap<String, String>,
        body: Vec<u8>,
        content_type: Option<String>,
    },
    Bytes(Vec<u8>),
    Text(String),
    Empty,
}

impl Response {
    pub fn structured(status_code: u16, body: impl Into<Vec<u8>>) -> Self {
        Response::Structured {
            status_code: Some(status_code),
            headers: HashMap::new(),
            body: body.into(),
            content_type: None,
        }
    }
}

/// Failure reported by the function itself, after it ran
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ProcessError {
    pub message: String,
    /// Status the function asked synchronous adapters to respond with
    pub status_code: Option<u16>,
}

impl ProcessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: Some(status_code),
        }
    }
}

pub type ProcessResult = std::result::Result<Response, ProcessError>;

/// Something able to run one function invocation at a time
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn process_event(&self, event: &Event) -> ProcessResult;
}

/// Builds the runtime owned by a single worker
pub trait RuntimeFactory: Send + Sync {
    fn create(&self, config: &RuntimeConfig, worker_index: usize) -> Result<Arc<dyn Runtime>>;
}

impl<F> RuntimeFactory for F
where
    F: Fn(&RuntimeConfig, usize) -> Result<Arc<dyn Runtime>> + Send + Sync,
{
    fn create(&self, config: &RuntimeConfig, worker_index: usize) -> Result<Arc<dyn Runtime>> {
        self(config, worker_index)
    }
}

/// Returns the event body unchanged
#[derive(Debug, Default)]
pub struct EchoRuntime;

#[async_trait]
impl Runtime for EchoRuntime {
    async fn process_event(&self, event: &Event) -> ProcessResult {
        Ok(Response::Structured {
            status_code: Some(200),
            headers: HashMap::new(),
            body: event.body.clone(),
            content_type: (!event.content_type.is_empty()).then(|| event.content_type.clone()),
        })
    }
}

#[derive(Debug, Default)]
pub struct EchoRuntimeFactory;

impl RuntimeFactory for EchoRuntimeFactory {
    fn create(&self, _config: &RuntimeConfig, _worker_index: usize) -> Result<Arc<dyn Runtime>> {
        Ok(Arc::new(EchoRuntime))
    }
}

/// Runtime backed by a synchronous closure, for embedding simple handlers
pub struct FnRuntime<F> {
    handler: F,
}

impl<F> FnRuntime<F>
where
    F: Fn(&Event) -> ProcessResult + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> fmt::Debug for FnRuntime<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnRuntime").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Runtime for FnRuntime<F>
where
    F: Fn(&Event) -> ProcessResult + Send + Sync,
{
    async fn process_event(&self, event: &Event) -> ProcessResult {
        (self.handler)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_returns_body() {
        let event = Event::new("ping").with_content_type("text/plain");
        let response = EchoRuntime.process_event(&event).await.unwrap();

        assert_eq!(
            response,
            Response::Structured {
                status_code: Some(200),
                headers: HashMap::new(),
                body: b"ping".to_vec(),
                content_type: Some("text/plain".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_closure_factory() {
        let factory = |_config: &RuntimeConfig, index: usize| -> Result<Arc<dyn Runtime>> {
            Ok(Arc::new(FnRuntime::new(move |_event: &Event| {
                Ok(Response::Text(format!("worker-{index}")))
            })))
        };

        let runtime = factory.create(&RuntimeConfig::default(), 3).unwrap();
        let response = runtime.process_event(&Event::default()).await.unwrap();
        assert_eq!(response, Response::Text("worker-3".to_string()));
    }
}
