//! # Kind Registries
//!
//! Explicit name → factory tables, built by the bootstrap and consulted once
//! per configured trigger or runtime.
//!
//! ## Overview
//!
//! A [`Registry`] maps a lowercase, hyphenated kind (`"http"`, `"rabbit-mq"`,
//! `"v3io-item-poller"`, ...) to a shared factory. Registering a kind twice is
//! a programming error and is reported as [`DispatchError::DuplicateKind`],
//! which the bootstrap treats as fatal. Looking up an unknown kind is an
//! ordinary configuration error ([`DispatchError::UnknownKind`]).
//!
//! ## Usage
//!
//! ```rust
//! use eventsource_core::registry::Registries;
//!
//! let registries = Registries::with_builtins().unwrap();
//! assert!(registries.sources.get("http").is_ok());
//! assert!(registries.sources.get("carrier-pigeon").is_err());
//! ```

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{DispatchError, Result};
use crate::logging::log_registry_operation;
use crate::runtime::{EchoRuntimeFactory, RuntimeFactory};
use crate::source::generator::GeneratorEventSourceFactory;
use crate::source::http::HttpEventSourceFactory;
use crate::source::poller::{ItemPollerFactory, ItemStore};
use crate::source::queue::{MessageBroker, NatsEventSourceFactory, RabbitMqEventSourceFactory};
use crate::source::stream::{ShardClient, StreamEventSourceFactory};
use crate::source::{generator, http, poller, queue, stream, EventSourceFactory};

/// Kind → factory table
pub struct Registry<F: ?Sized> {
    name: &'static str,
    factories: DashMap<String, Arc<F>>,
}

impl<F: ?Sized> std::fmt::Debug for Registry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl<F: ?Sized> Registry<F> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            factories: DashMap::new(),
        }
    }

    /// Register `factory` under `kind`. Fails if the kind is taken.
    pub fn register(&self, kind: &str, factory: Arc<F>) -> Result<()> {
        match self.factories.entry(kind.to_string()) {
            Entry::Occupied(_) => {
                log_registry_operation(self.name, "register", kind, "duplicate");
                Err(DispatchError::DuplicateKind {
                    kind: kind.to_string(),
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(factory);
                log_registry_operation(self.name, "register", kind, "success");
                Ok(())
            }
        }
    }

    pub fn get(&self, kind: &str) -> Result<Arc<F>> {
        self.factories
            .get(kind)
            .map(|factory| Arc::clone(factory.value()))
            .ok_or_else(|| DispatchError::UnknownKind {
                kind: kind.to_string(),
            })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

pub type EventSourceRegistry = Registry<dyn EventSourceFactory>;
pub type RuntimeRegistry = Registry<dyn RuntimeFactory>;

/// The registries a processor resolves kinds against
#[derive(Debug)]
pub struct Registries {
    pub sources: EventSourceRegistry,
    pub runtimes: RuntimeRegistry,
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

impl Registries {
    pub fn new() -> Self {
        Self {
            sources: Registry::new("event_sources"),
            runtimes: Registry::new("runtimes"),
        }
    }

    /// Registries holding every kind that needs no external client:
    /// `http` and `generator` sources and the `echo` runtime
    pub fn with_builtins() -> Result<Self> {
        let registries = Self::new();
        registries
            .sources
            .register(http::KIND, Arc::new(HttpEventSourceFactory))?;
        registries
            .sources
            .register(generator::KIND, Arc::new(GeneratorEventSourceFactory))?;
        registries
            .runtimes
            .register("echo", Arc::new(EchoRuntimeFactory))?;
        Ok(registries)
    }

    /// Register `nats` and `rabbit-mq` against a broker connection
    pub fn register_broker(&self, broker: Arc<dyn MessageBroker>) -> Result<()> {
        self.sources.register(
            queue::NATS_KIND,
            Arc::new(NatsEventSourceFactory::new(Arc::clone(&broker))),
        )?;
        self.sources.register(
            queue::RABBIT_MQ_KIND,
            Arc::new(RabbitMqEventSourceFactory::new(broker)),
        )
    }

    /// Register `kinesis` against a stream client
    pub fn register_stream(&self, client: Arc<dyn ShardClient>) -> Result<()> {
        self.sources
            .register(stream::KIND, Arc::new(StreamEventSourceFactory::new(client)))
    }

    /// Register `v3io-item-poller` against an item store
    pub fn register_item_store(&self, store: Arc<dyn ItemStore>) -> Result<()> {
        self.sources.register(
            poller::item_poller::KIND,
            Arc::new(ItemPollerFactory::new(store)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::queue::InMemoryBroker;

    #[test]
    fn test_duplicate_kind_is_rejected() {
        let registry: EventSourceRegistry = Registry::new("test");
        registry.register("foo", Arc::new(HttpEventSourceFactory)).unwrap();

        let err = registry
            .register("foo", Arc::new(GeneratorEventSourceFactory))
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::DuplicateKind {
                kind: "foo".to_string()
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_returns_registered_instance() {
        let registry: RuntimeRegistry = Registry::new("test");
        let factory: Arc<dyn RuntimeFactory> = Arc::new(EchoRuntimeFactory);
        registry.register("foo", Arc::clone(&factory)).unwrap();

        let found = registry.get("foo").unwrap();
        assert!(Arc::ptr_eq(&found, &factory));
    }

    #[test]
    fn test_unknown_kind() {
        let registry: RuntimeRegistry = Registry::new("test");
        assert!(matches!(
            registry.get("missing"),
            Err(DispatchError::UnknownKind { .. })
        ));
    }

    #[test]
    fn test_builtins_and_clients() {
        let registries = Registries::with_builtins().unwrap();
        registries
            .register_broker(Arc::new(InMemoryBroker::new()))
            .unwrap();

        assert_eq!(
            registries.sources.kinds(),
            vec!["generator", "http", "nats", "rabbit-mq"]
        );
        assert!(registries.runtimes.contains("echo"));

        assert!(registries
            .register_broker(Arc::new(InMemoryBroker::new()))
            .is_err());
    }
}
