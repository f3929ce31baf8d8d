//! Configuration error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to load configuration from {source_name}: {reason}")]
    LoadFailed { source_name: String, reason: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Missing required field '{field}' in {context}")]
    MissingField { field: String, context: String },

    #[error("Failed to parse attributes of trigger '{trigger}': {reason}")]
    InvalidAttributes { trigger: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>, context: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
            context: context.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(error: config::ConfigError) -> Self {
        Self::LoadFailed {
            source_name: "config".to_string(),
            reason: error.to_string(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigurationError>;
