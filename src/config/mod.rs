//! # Processor Configuration
//!
//! Serde structures describing the function runtime and the set of triggers
//! (event sources) the processor should run. Trigger-specific options live in a
//! free-form `attributes` map and are decoded by each adapter into its own typed
//! configuration via [`TriggerConfig::typed_attributes`].
//!
//! ```yaml
//! runtime:
//!   kind: echo
//! triggers:
//!   web:
//!     kind: http
//!     num_workers: 4
//!     attributes:
//!       listen_address: "0.0.0.0:8080"
//! ```

pub mod error;
pub mod loader;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

/// Timeout used by adapters that wait for a worker on every event
pub const DEFAULT_WORKER_AVAILABILITY_TIMEOUT_MS: u64 = 10_000;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProcessorConfig {
    /// Function runtime shared by all workers
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Triggers keyed by their user given ID
    #[serde(default)]
    pub triggers: BTreeMap<String, TriggerConfig>,
}

impl ProcessorConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.runtime.kind.trim().is_empty() {
            return Err(ConfigurationError::missing_field("kind", "runtime"));
        }

        for (id, trigger) in &self.triggers {
            trigger.validate(id)?;
        }

        Ok(())
    }
}

/// Function runtime configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Registry key of the runtime (e.g. "echo")
    pub kind: String,

    /// Optional handler name passed through to the runtime
    #[serde(default)]
    pub handler: Option<String>,

    /// Runtime specific options
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: "echo".to_string(),
            handler: None,
            attributes: serde_json::Map::new(),
        }
    }
}

/// Configuration of a single trigger
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TriggerConfig {
    /// Registry key of the event source (e.g. "http", "kinesis")
    pub kind: String,

    /// Worker pool size. Each adapter applies its own default when unset.
    #[serde(default)]
    pub num_workers: Option<usize>,

    /// How long a single event may wait for a free worker
    #[serde(default = "default_worker_availability_timeout_ms")]
    pub worker_availability_timeout_ms: u64,

    /// Adapter specific options
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

fn default_worker_availability_timeout_ms() -> u64 {
    DEFAULT_WORKER_AVAILABILITY_TIMEOUT_MS
}

impl TriggerConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            num_workers: None,
            worker_availability_timeout_ms: DEFAULT_WORKER_AVAILABILITY_TIMEOUT_MS,
            attributes: serde_json::Map::new(),
        }
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Pool size for this trigger, `default` when unset. An explicit zero is
    /// rejected: the source would start and never run the function.
    pub fn worker_count(&self, trigger_id: &str, default: usize) -> ConfigResult<usize> {
        match self.num_workers.unwrap_or(default) {
            0 => Err(ConfigurationError::invalid_value(
                "num_workers",
                format!("trigger '{trigger_id}' needs at least one worker"),
            )),
            count => Ok(count),
        }
    }

    pub fn worker_availability_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_availability_timeout_ms)
    }

    /// Decode the free-form attributes into an adapter's typed configuration
    pub fn typed_attributes<T: DeserializeOwned>(&self, trigger_id: &str) -> ConfigResult<T> {
        serde_json::from_value(serde_json::Value::Object(self.attributes.clone())).map_err(|e| {
            ConfigurationError::InvalidAttributes {
                trigger: trigger_id.to_string(),
                reason: e.to_string(),
            }
        })
    }

    fn validate(&self, id: &str) -> ConfigResult<()> {
        if self.kind.trim().is_empty() {
            return Err(ConfigurationError::missing_field(
                "kind",
                format!("trigger '{id}'"),
            ));
        }
        // unset is fine here, each adapter has its own default
        self.worker_count(id, 1)?;
        Ok(())
    }
}

/// Number of workers to use when a pool size should follow the host's parallelism
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct SampleAttributes {
        listen_address: String,
        #[serde(default)]
        verbose: bool,
    }

    #[test]
    fn test_typed_attributes_decode() {
        let trigger = TriggerConfig::new("http")
            .with_attribute("listen_address", json!("127.0.0.1:9000"));

        let attributes: SampleAttributes = trigger.typed_attributes("web").unwrap();
        assert_eq!(attributes.listen_address, "127.0.0.1:9000");
        assert!(!attributes.verbose);
    }

    #[test]
    fn test_typed_attributes_report_trigger() {
        let trigger = TriggerConfig::new("http").with_attribute("listen_address", json!(42));

        let err = trigger
            .typed_attributes::<SampleAttributes>("web")
            .unwrap_err();
        assert!(err.to_string().contains("'web'"));
    }

    #[test]
    fn test_validate_rejects_empty_kind() {
        let mut config = ProcessorConfig::default();
        config
            .triggers
            .insert("broken".to_string(), TriggerConfig::new(" "));

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let trigger = TriggerConfig::new("generator").with_num_workers(0);
        let err = trigger.worker_count("load", 1).unwrap_err();
        assert!(err.to_string().contains("'load'"));

        let mut config = ProcessorConfig::default();
        config.triggers.insert("load".to_string(), trigger);
        assert!(config.validate().is_err());

        let unset = TriggerConfig::new("generator");
        assert!(unset.worker_count("load", 0).is_err());
        assert_eq!(unset.worker_count("load", 4).unwrap(), 4);
    }

    #[test]
    fn test_defaults() {
        let trigger = TriggerConfig::new("generator");
        assert_eq!(trigger.worker_count("gen", 1).unwrap(), 1);
        assert_eq!(trigger.worker_availability_timeout(), Duration::from_secs(10));
        assert_eq!(RuntimeConfig::default().kind, "echo");
    }
}
