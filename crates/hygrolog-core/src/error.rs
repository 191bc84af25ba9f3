//! Unified error types for the hygrolog core library.
//!
//! [`HygrologError`] covers every failure that can end the process. The
//! modules keep their own specific error types ([`ConfigError`],
//! [`StorageError`], [`TransportError`]) and convert into this one at the
//! boundary.
//!
//! Attempt-level failures ([`AcquisitionFailure`](crate::AcquisitionFailure))
//! never reach this type. The retry loop absorbs them.
//!
//! # Example
//!
//! ```rust
//! use hygrolog_core::error::{HygrologError, Result};
//!
//! fn require_address(addresses: &[String]) -> Result<&str> {
//!     addresses
//!         .first()
//!         .map(String::as_str)
//!         .ok_or_else(|| HygrologError::ConfigurationInvalid("no sensor address".into()))
//! }
//!
//! let err = require_address(&[]).unwrap_err();
//! assert_eq!(err.error_code(), "CONFIGURATION_INVALID");
//! ```

use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StorageError;
use crate::transport::TransportError;

/// The unified error type for all hygrolog operations.
#[derive(Debug, Error)]
pub enum HygrologError {
    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// The Bluetooth stack or adapter cannot be used.
    #[error(
        "Bluetooth unavailable: {0}. Ensure bluetoothd is running and the adapter is present."
    )]
    TransportUnavailable(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration sources could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but cannot be used.
    #[error("Configuration invalid: {0}")]
    ConfigurationInvalid(String),

    // =========================================================================
    // RUNTIME ERRORS
    // =========================================================================
    /// Opening or migrating the database failed.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A poll or retention loop ended before shutdown.
    #[error("Scheduler stopped unexpectedly: {0}")]
    SchedulerStopped(String),
}

/// A specialized [`Result`] type for hygrolog operations.
pub type Result<T> = std::result::Result<T, HygrologError>;

impl HygrologError {
    /// Returns a machine-readable error code for logs.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::TransportUnavailable(_) => "TRANSPORT_UNAVAILABLE",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigurationInvalid(_) => "CONFIGURATION_INVALID",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::SchedulerStopped(_) => "SCHEDULER_STOPPED",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<ConfigError> for HygrologError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigurationInvalid(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigurationInvalid(messages.join("; "))
            }
        }
    }
}

impl From<StorageError> for HygrologError {
    fn from(err: StorageError) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

/// Transport errors only surface here while the transport is being set up.
impl From<TransportError> for HygrologError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AdapterUnavailable { message } => Self::TransportUnavailable(message),
            TransportError::InvalidAddress { address } => {
                Self::ConfigurationInvalid(format!("Invalid Bluetooth address: {address}"))
            }
            other @ (TransportError::CharacteristicNotFound { .. }
            | TransportError::Operation { .. }) => Self::TransportUnavailable(other.to_string()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HygrologConfig;

    #[test]
    fn test_error_codes() {
        let invalid = HygrologError::ConfigurationInvalid("x".into());
        assert_eq!(invalid.error_code(), "CONFIGURATION_INVALID");

        let unavailable = HygrologError::TransportUnavailable("x".into());
        assert_eq!(unavailable.error_code(), "TRANSPORT_UNAVAILABLE");

        let stopped = HygrologError::SchedulerStopped("Poll loop panicked".into());
        assert_eq!(stopped.error_code(), "SCHEDULER_STOPPED");
    }

    #[test]
    fn test_from_config_validation_errors() {
        let err: HygrologError = ConfigError::MultipleValidationErrors(vec![
            ConfigError::ValidationError {
                field: "sensor.addresses".into(),
                message: "at least one address is required".into(),
            },
            ConfigError::ValidationError {
                field: "acquisition.attempts".into(),
                message: "must be at least 1".into(),
            },
        ])
        .into();

        assert!(matches!(err, HygrologError::ConfigurationInvalid(_)));
        let message = err.to_string();
        assert!(message.contains("sensor.addresses"));
        assert!(message.contains("acquisition.attempts"));
    }

    #[test]
    fn test_from_config_parse_error() {
        let parse = HygrologConfig::from_toml_str("[sensor\n").unwrap_err();
        let err: HygrologError = parse.into();
        assert_eq!(err.error_code(), "CONFIG_PARSE_ERROR");
    }

    #[test]
    fn test_from_transport_error() {
        let err: HygrologError = TransportError::AdapterUnavailable {
            message: "org.bluez not found".into(),
        }
        .into();
        assert!(matches!(err, HygrologError::TransportUnavailable(ref m) if m.contains("bluez")));

        let err: HygrologError = TransportError::InvalidAddress {
            address: "nope".into(),
        }
        .into();
        assert!(matches!(err, HygrologError::ConfigurationInvalid(_)));

        let err: HygrologError = TransportError::Operation {
            message: "power on failed".into(),
        }
        .into();
        assert!(matches!(err, HygrologError::TransportUnavailable(_)));
    }

    #[test]
    fn test_from_storage_error() {
        let err: HygrologError = StorageError::InvalidTimestamp {
            id: 7,
            value: "yesterday".into(),
        }
        .into();
        assert!(matches!(err, HygrologError::PersistenceError(_)));
        assert!(err.to_string().contains("yesterday"));
    }

    #[test]
    fn test_error_display_messages() {
        let err = HygrologError::TransportUnavailable("no adapter".into());
        assert!(err.to_string().contains("bluetoothd"));

        let err = HygrologError::SchedulerStopped("Retention loop exited before shutdown".into());
        assert!(err.to_string().contains("Retention loop"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<HygrologError>();
        assert_sync::<HygrologError>();
    }
}
