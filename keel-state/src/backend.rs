//! Error types and backend configuration

use std::collections::HashMap;

use thiserror::Error;

use crate::kv::KvError;
use crate::lock::LockStatus;

/// Errors surfaced by the lock and state stores
#[derive(Debug, Error)]
pub enum BackendError {
    /// The lock is held by another operator
    #[error("Lock for {scope} is already held ({status})")]
    LockHeld { scope: String, status: LockStatus },

    /// The presented token is not the one stored in the lock
    #[error("Lock token for {scope} does not match ({status}); it was stolen or already released")]
    LockMismatch { scope: String, status: LockStatus },

    /// A different state was already written at this serial
    #[error(
        "State conflict for {scope}: different content is already stored at serial {serial}; \
         re-read the latest state and write it with a higher serial"
    )]
    StateConflict { scope: String, serial: u64 },

    /// Any other backend failure
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(#[from] KvError),

    /// State document is malformed or lacks a serial
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Local file I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// The backend type is not supported
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// Configuration error
    #[error("Backend configuration error: {0}")]
    Configuration(String),
}

impl BackendError {
    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Configuration for a key-value backend
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Backend type ("dynamodb" or "memory")
    pub backend_type: String,
    /// Backend-specific attributes (e.g. "region", "endpoint")
    pub attributes: HashMap<String, String>,
}

impl BackendConfig {
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            attributes: HashMap::new(),
        }
    }

    /// Set an attribute value
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockHolder;

    #[test]
    fn test_lock_held_display() {
        let error = BackendError::LockHeld {
            scope: "infra/prod.rb".to_string(),
            status: LockStatus::Locked(LockHolder {
                locked_at: "2024-01-01T00:00:00+00:00".to_string(),
                owner: "alice@build-host".to_string(),
            }),
        };

        let message = error.to_string();
        assert!(message.contains("infra/prod.rb"));
        assert!(message.contains("alice@build-host"));
        assert!(message.contains("2024-01-01T00:00:00+00:00"));
    }

    #[test]
    fn test_state_conflict_display() {
        let error = BackendError::StateConflict {
            scope: "infra/prod.rb".to_string(),
            serial: 12,
        };
        assert!(error.to_string().contains("serial 12"));
    }

    #[test]
    fn test_backend_error_display() {
        let error = BackendError::unsupported_backend("azure");
        assert_eq!(error.to_string(), "Unsupported backend type: azure");

        let error = BackendError::from(KvError::TableNotFound("keel-state".to_string()));
        assert_eq!(
            error.to_string(),
            "Backend unavailable: Table not found: keel-state"
        );
    }

    #[test]
    fn test_backend_config_attributes() {
        let config = BackendConfig::new("dynamodb").with_attribute("region", "eu-west-1");
        assert_eq!(config.get_string("region"), Some("eu-west-1"));
        assert_eq!(config.get_string("endpoint"), None);
    }
}
