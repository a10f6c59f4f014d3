//! Error types and handling for Helios
//!
//! This module defines the error type shared by every provider, transport
//! and operator, together with the single translation point for the
//! sentinel error literals that devices and scripts report as plain text.

use crate::value::Capability;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for Helios operations
pub type Result<T> = std::result::Result<T, HeliosError>;

/// Main error type for Helios
#[derive(Debug, Clone, Error)]
pub enum HeliosError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// A provider was asked for a capability it does not have
    #[error("Configuration error: {path}: {kind} does not provide {capability}")]
    Capability {
        path: String,
        kind: String,
        capability: Capability,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File and process I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Network-related errors (HTTP, WebSocket)
    #[error("Network error: {message}")]
    Network { message: String },

    /// MQTT broker errors
    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    /// Modbus communication errors
    #[error("Modbus error: {message}")]
    Modbus { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Payload transform errors
    #[error("Transform error: {message}")]
    Transform { message: String },

    /// Value coercion errors
    #[error("Type error: {message}")]
    Type { message: String },

    /// Script execution or evaluation errors
    #[error("Script error: {message}")]
    Script { message: String },

    /// Lookup failures inside operators
    #[error("value not found: {message}")]
    NotFound { message: String },

    /// Push source has not been updated within its staleness window
    #[error("{name} outdated: {elapsed:?}")]
    Outdated { name: String, elapsed: Duration },

    /// Push source never delivered a value
    #[error("{name}: no initial value")]
    NoInitialValue { name: String },

    /// Device is asleep
    #[error("asleep")]
    Asleep,

    /// Transient failure, caller should retry
    #[error("must retry")]
    MustRetry,

    /// Value is not available from this device
    #[error("not available")]
    NotAvailable,

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl HeliosError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        HeliosError::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        HeliosError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        HeliosError::Io {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        HeliosError::Network {
            message: message.into(),
        }
    }

    /// Create a new MQTT error
    pub fn mqtt<S: Into<String>>(message: S) -> Self {
        HeliosError::Mqtt {
            message: message.into(),
        }
    }

    /// Create a new Modbus error
    pub fn modbus<S: Into<String>>(message: S) -> Self {
        HeliosError::Modbus {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        HeliosError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new transform error
    pub fn transform<S: Into<String>>(message: S) -> Self {
        HeliosError::Transform {
            message: message.into(),
        }
    }

    /// Create a new type error
    pub fn type_error<S: Into<String>>(message: S) -> Self {
        HeliosError::Type {
            message: message.into(),
        }
    }

    /// Create a new script error
    pub fn script<S: Into<String>>(message: S) -> Self {
        HeliosError::Script {
            message: message.into(),
        }
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        HeliosError::NotFound {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        HeliosError::Generic {
            message: message.into(),
        }
    }

    /// The error text without the category prefix added by `Display`
    pub fn message(&self) -> String {
        match self {
            HeliosError::Config { message }
            | HeliosError::Serialization { message }
            | HeliosError::Io { message }
            | HeliosError::Network { message }
            | HeliosError::Mqtt { message }
            | HeliosError::Modbus { message }
            | HeliosError::Timeout { message }
            | HeliosError::Transform { message }
            | HeliosError::Type { message }
            | HeliosError::Script { message }
            | HeliosError::NotFound { message }
            | HeliosError::Generic { message } => message.clone(),
            HeliosError::Validation { field, message } => format!("{}: {}", field, message),
            HeliosError::Asleep => SENTINEL_ASLEEP.to_string(),
            HeliosError::MustRetry => SENTINEL_MUST_RETRY.to_string(),
            HeliosError::NotAvailable => SENTINEL_NOT_AVAILABLE.to_string(),
            _ => self.to_string(),
        }
    }

    /// Whether this is one of the transient sentinel errors
    pub fn is_transient(&self) -> bool {
        matches!(self, HeliosError::Asleep | HeliosError::MustRetry)
    }

    /// Whether the error belongs to the timeout class
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            HeliosError::Timeout { .. }
                | HeliosError::Outdated { .. }
                | HeliosError::NoInitialValue { .. }
        )
    }
}

/// Literal spelling of the sentinel errors as reported by devices and scripts
pub const SENTINEL_ASLEEP: &str = "ErrAsleep";
pub const SENTINEL_MUST_RETRY: &str = "ErrMustRetry";
pub const SENTINEL_NOT_AVAILABLE: &str = "ErrNotAvailable";

/// Map a raw sentinel literal to its typed error
pub fn sentinel(raw: &str) -> Option<HeliosError> {
    match raw.trim() {
        SENTINEL_ASLEEP => Some(HeliosError::Asleep),
        SENTINEL_MUST_RETRY => Some(HeliosError::MustRetry),
        SENTINEL_NOT_AVAILABLE => Some(HeliosError::NotAvailable),
        _ => None,
    }
}

/// Pass a raw transport value through, failing if it is a sentinel literal
pub fn check_sentinel(raw: String) -> Result<String> {
    match sentinel(&raw) {
        Some(err) => Err(err),
        None => Ok(raw),
    }
}

impl From<std::io::Error> for HeliosError {
    fn from(err: std::io::Error) -> Self {
        HeliosError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for HeliosError {
    fn from(err: serde_yaml::Error) -> Self {
        HeliosError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HeliosError {
    fn from(err: serde_json::Error) -> Self {
        HeliosError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for HeliosError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HeliosError::timeout(err.to_string())
        } else {
            HeliosError::network(err.to_string())
        }
    }
}

impl From<regex::Error> for HeliosError {
    fn from(err: regex::Error) -> Self {
        HeliosError::config(format!("invalid regex: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = HeliosError::config("test config error");
        assert!(matches!(err, HeliosError::Config { .. }));

        let err = HeliosError::modbus("test modbus error");
        assert!(matches!(err, HeliosError::Modbus { .. }));

        let err = HeliosError::validation("field", "test validation error");
        assert!(matches!(err, HeliosError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = HeliosError::config("test error");
        assert_eq!(err.to_string(), "Configuration error: test error");

        let err = HeliosError::not_found("99");
        assert_eq!(err.to_string(), "value not found: 99");

        let err = HeliosError::Outdated {
            name: "meter/power".to_string(),
            elapsed: Duration::from_secs(3),
        };
        assert_eq!(err.to_string(), "meter/power outdated: 3s");
    }

    #[test]
    fn test_sentinel_translation() {
        assert!(matches!(sentinel("ErrAsleep"), Some(HeliosError::Asleep)));
        assert!(matches!(
            sentinel(" ErrMustRetry\n"),
            Some(HeliosError::MustRetry)
        ));
        assert!(matches!(
            check_sentinel("ErrNotAvailable".to_string()),
            Err(HeliosError::NotAvailable)
        ));
        assert_eq!(check_sentinel("42".to_string()).unwrap(), "42");
        assert!(sentinel("errasleep").is_none());
    }

    #[test]
    fn test_error_classes() {
        assert!(HeliosError::Asleep.is_transient());
        assert!(!HeliosError::NotAvailable.is_transient());
        assert!(HeliosError::timeout("x").is_timeout());
    }
}
