//! Configuration Loader
//!
//! Layers a YAML file with `PROCESSOR__`-prefixed environment variable overrides
//! (e.g. `PROCESSOR__RUNTIME__KIND=echo`) using the `config` crate.

use super::error::{ConfigResult, ConfigurationError};
use super::ProcessorConfig;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_CONFIG_PATH: &str = "config/processor.yaml";
const ENV_PREFIX: &str = "PROCESSOR";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from an explicit path, or from `config/processor.yaml` when present
    pub fn load(path: Option<&Path>) -> ConfigResult<ProcessorConfig> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        debug!(
            path = %path.display(),
            required = required,
            "Loading processor configuration"
        );

        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_path()).required(required))
            .add_source(Self::environment())
            .build()
            .map_err(|e| ConfigurationError::LoadFailed {
                source_name: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let config = Self::finish(settings)?;

        info!(
            path = %path.display(),
            runtime = %config.runtime.kind,
            triggers = config.triggers.len(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Load from an in-memory YAML document (environment overrides still apply)
    pub fn load_from_str(yaml: &str) -> ConfigResult<ProcessorConfig> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .add_source(Self::environment())
            .build()?;

        Self::finish(settings)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
    }

    fn finish(settings: config::Config) -> ConfigResult<ProcessorConfig> {
        let config: ProcessorConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
