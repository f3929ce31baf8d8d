//! # HTTP Event Source
//!
//! Synchronous trigger: every request becomes an event drawn from an
//! [`EventPool`] and the function's response is written back to the client.
//! The pool size caps requests in flight independently of the worker count.
//!
//! Status mapping:
//! - no worker available within the timeout: `503`
//! - any other submission failure: `500`
//! - function error: the status it asked for, else `500`

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response as HttpResponse;
use axum::Router;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

use super::{
    BaseEventSource, Checkpoint, EventSource, EventSourceFactory, SourceClass, SourceTasks,
    SubmitOutcome,
};
use crate::config::TriggerConfig;
use crate::error::{DispatchError, Result};
use crate::event::EventPool;
use crate::logging::log_source_operation;
use crate::runtime::Response;
use crate::statistics::SourceStatisticsSnapshot;
use crate::worker::{Worker, WorkerAllocator, WorkerFactory};

pub const KIND: &str = "http";

const DEFAULT_NUM_WORKERS: usize = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Size of the event pool, i.e. the maximum number of requests in flight
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_in_flight() -> usize {
    256
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

struct HttpState {
    base: BaseEventSource,
    events: Arc<EventPool>,
    timeout: Duration,
}

pub struct HttpEventSource {
    state: Arc<HttpState>,
    config: HttpConfig,
    tasks: SourceTasks,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpEventSource {
    pub fn new(
        id: &str,
        trigger: &TriggerConfig,
        config: HttpConfig,
        allocator: Arc<dyn WorkerAllocator>,
    ) -> Self {
        let state = HttpState {
            base: BaseEventSource::new(id, KIND, SourceClass::Sync, allocator),
            events: Arc::new(EventPool::new(config.max_in_flight)),
            timeout: trigger.worker_availability_timeout(),
        };

        Self {
            state: Arc::new(state),
            config,
            tasks: SourceTasks::new(),
            local_addr: Mutex::new(None),
        }
    }

    /// Request router, usable without binding a socket
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle_request)
            .with_state(Arc::clone(&self.state))
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    fn id(&self) -> &str {
        self.state.base.id()
    }

    fn class(&self) -> SourceClass {
        SourceClass::Sync
    }

    fn kind(&self) -> &str {
        KIND
    }

    #[instrument(skip(self, _checkpoint), fields(source_id = %self.id()))]
    async fn start(&self, _checkpoint: Checkpoint) -> Result<()> {
        self.state.base.require_shareable()?;
        let mut signal = self.tasks.begin()?;

        let listener = match tokio::net::TcpListener::bind(&self.config.listen_address).await {
            Ok(listener) => listener,
            Err(e) => {
                self.tasks.shutdown(true).await;
                return Err(DispatchError::Transport(format!(
                    "Failed to bind to {}: {}",
                    self.config.listen_address, e
                )));
            }
        };

        let address = listener.local_addr().ok();
        *self.local_addr.lock() = address;

        let server = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { signal.triggered().await });

        let source_id = self.id().to_string();
        self.tasks.spawn(async move {
            if let Err(e) = server.await {
                error!(source_id = %source_id, "HTTP server error: {}", e);
            }
        });

        let details = address.map(|a| a.to_string());
        log_source_operation("start", self.id(), KIND, "success", details.as_deref());
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<Checkpoint> {
        self.tasks.shutdown(force).await;
        *self.local_addr.lock() = None;
        log_source_operation("stop", self.id(), KIND, "success", None);
        Ok(Checkpoint::none())
    }

    fn statistics(&self) -> SourceStatisticsSnapshot {
        self.state.base.statistics()
    }

    fn workers(&self) -> Vec<Arc<Worker>> {
        self.state.base.workers()
    }

    fn config(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
    }
}

async fn handle_request(
    State(state): State<Arc<HttpState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    let mut event = state.events.get().await;

    // pooled events keep the time they were returned
    event.timestamp = Utc::now();
    event.method.push_str(method.as_str());
    event.path.push_str(uri.path());
    event.body.extend_from_slice(&body);
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            event.headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    if let Some(content_type) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        event.content_type.push_str(content_type);
    }
    if let Some(query) = uri.query() {
        event
            .attributes
            .insert("query".to_string(), serde_json::Value::from(query));
    }

    match state.base.submit_event(&mut event, Some(state.timeout)).await {
        SubmitOutcome::NoWorker(err) => {
            let status = if err.is_allocation_failure() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            plain_response(status, err.to_string())
        }
        SubmitOutcome::Failed(err) => {
            let status = err
                .status_code
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            plain_response(status, err.message)
        }
        SubmitOutcome::Completed(response) => function_response(response),
    }
}

fn plain_response(status: StatusCode, message: String) -> HttpResponse {
    let mut response = HttpResponse::new(Body::from(message));
    *response.status_mut() = status;
    response
}

fn function_response(response: Response) -> HttpResponse {
    match response {
        Response::Structured {
            status_code,
            headers,
            body,
            content_type,
        } => {
            let status = status_code
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::OK);
            let mut builder = HttpResponse::builder().status(status);
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(content_type) = content_type {
                builder = builder.header(header::CONTENT_TYPE, content_type);
            }
            builder.body(Body::from(body)).unwrap_or_else(|e| {
                plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Invalid function response: {e}"),
                )
            })
        }
        Response::Bytes(body) => with_content_type(body, "application/octet-stream"),
        Response::Text(body) => with_content_type(body.into_bytes(), "text/plain; charset=utf-8"),
        Response::Empty => HttpResponse::new(Body::empty()),
    }
}

fn with_content_type(body: Vec<u8>, content_type: &'static str) -> HttpResponse {
    let mut response = HttpResponse::new(Body::from(body));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[derive(Debug, Default)]
pub struct HttpEventSourceFactory;

impl EventSourceFactory for HttpEventSourceFactory {
    fn create(
        &self,
        id: &str,
        trigger: &TriggerConfig,
        worker_factory: &WorkerFactory,
    ) -> Result<Arc<dyn EventSource>> {
        let config: HttpConfig = trigger.typed_attributes(id)?;
        if config.max_in_flight == 0 {
            return Err(DispatchError::Configuration(format!(
                "Trigger '{id}': max_in_flight must be greater than zero"
            )));
        }

        let num_workers = trigger.worker_count(id, DEFAULT_NUM_WORKERS)?;
        let allocator = worker_factory.create_fixed_pool(num_workers)?;
        info!(
            source_id = %id,
            listen_address = %config.listen_address,
            workers = allocator.capacity(),
            "Created HTTP event source"
        );

        Ok(Arc::new(HttpEventSource::new(id, trigger, config, allocator)))
    }
}
