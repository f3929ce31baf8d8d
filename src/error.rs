//! Error types for the dispatch core.
//!
//! `DispatchError` covers everything that can go wrong *around* a function
//! invocation: allocating a worker, building a source, talking to a transport.
//! Failures reported by the user function itself are `ProcessError`s and live in
//! [`crate::runtime`], so callers can never confuse the two.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("No available workers")]
    NoAvailableWorkers,
    #[error("Timed out allocating worker after {timeout_ms}ms")]
    AllocationTimeout { timeout_ms: u64 },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Unknown kind: {kind}")]
    UnknownKind { kind: String },
    #[error("Kind already registered: {kind}")]
    DuplicateKind { kind: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn allocation_timeout(timeout: Duration) -> Self {
        DispatchError::AllocationTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// True when no worker could be obtained, i.e. no user code ran
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            DispatchError::NoAvailableWorkers | DispatchError::AllocationTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(error: serde_json::Error) -> Self {
        DispatchError::Configuration(format!("JSON serialization error: {error}"))
    }
}

impl From<crate::config::ConfigurationError> for DispatchError {
    fn from(error: crate::config::ConfigurationError) -> Self {
        DispatchError::Configuration(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_failures_are_classified() {
        assert!(DispatchError::NoAvailableWorkers.is_allocation_failure());
        assert!(DispatchError::allocation_timeout(Duration::from_millis(250)).is_allocation_failure());
        assert!(!DispatchError::Transport("reset".to_string()).is_allocation_failure());
    }

    #[test]
    fn test_timeout_message_carries_millis() {
        let err = DispatchError::allocation_timeout(Duration::from_secs(2));
        assert_eq!(err.to_string(), "Timed out allocating worker after 2000ms");
    }
}
