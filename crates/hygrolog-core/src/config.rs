//! Application configuration management.
//!
//! Handles loading and validating hygrolog configuration including:
//! - The sensor address and data characteristic
//! - Per-phase acquisition timeouts and the retry budget
//! - Poll cadence and retention window
//! - Database location
//! - HTTP query server settings
//!
//! Configuration is read once at startup from a TOML file, with environment
//! overrides (`HYGROLOG__SECTION__KEY`). There is no hot-reload.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use config::{Environment, File, FileFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::acquisition::AttemptTimeouts;
use crate::collector::RetryPolicy;

/// Data characteristic that carries temperature/humidity notifications.
pub const DEFAULT_CHARACTERISTIC: Uuid = uuid::uuid!("ebe0ccc1-7a0a-4b0c-8a1a-6ff2997da3a6");

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "HYGROLOG_CONFIG";

/// Prefix for per-key environment overrides.
const ENV_PREFIX: &str = "HYGROLOG";

/// Upper bound for every `*_secs` setting (one year).
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Upper bound for `schedule.retention_days` (one hundred years).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("MAC address regex is valid")
});

/// Returns `true` if `address` looks like `XX:XX:XX:XX:XX:XX`.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address)
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The sources could not be merged or deserialized.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// The configuration could not be rendered back to TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field failed validation.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields failed validation.
    #[error("Configuration has {} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// The sensor to poll, resolved from [`SensorConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorTarget {
    /// Upper-case MAC address.
    pub address: String,
    /// Notification characteristic carrying readings.
    pub characteristic: Uuid,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HygrologConfig {
    /// Sensor identity.
    pub sensor: SensorConfig,
    /// Attempt timeouts and retry budget.
    pub acquisition: AcquisitionConfig,
    /// Poll and retention cadence.
    pub schedule: ScheduleConfig,
    /// Database location.
    pub storage: StorageConfig,
    /// HTTP query server.
    pub server: ServerConfig,
}

/// `[sensor]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Sensor MAC addresses. Only the first is polled.
    pub addresses: Vec<String>,
    /// Notification characteristic UUID.
    pub characteristic: Uuid,
    /// Bluetooth adapter name (e.g. `hci0`). Defaults to the system default.
    pub adapter: Option<String>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            characteristic: DEFAULT_CHARACTERISTIC,
            adapter: None,
        }
    }
}

/// `[acquisition]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Attempts per poll cycle.
    pub attempts: u32,
    /// Constant delay between attempts.
    pub retry_delay_secs: u64,
    /// Limit on finding the sensor.
    pub discovery_timeout_secs: u64,
    /// Limit on connecting and subscribing.
    pub connect_timeout_secs: u64,
    /// Limit on waiting for the notification.
    pub notification_timeout_secs: u64,
    /// Limit on each teardown step.
    pub teardown_timeout_secs: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay_secs: 5,
            discovery_timeout_secs: 10,
            connect_timeout_secs: 20,
            notification_timeout_secs: 10,
            teardown_timeout_secs: 5,
        }
    }
}

impl AcquisitionConfig {
    /// Phase timeouts for one attempt.
    #[must_use]
    pub const fn timeouts(&self) -> AttemptTimeouts {
        AttemptTimeouts {
            discovery: Duration::from_secs(self.discovery_timeout_secs),
            connect: Duration::from_secs(self.connect_timeout_secs),
            notification: Duration::from_secs(self.notification_timeout_secs),
            teardown: Duration::from_secs(self.teardown_timeout_secs),
        }
    }

    /// Retry budget for one poll cycle.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            delay: Duration::from_secs(self.retry_delay_secs),
        }
    }
}

/// `[schedule]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Sleep between poll cycles.
    pub poll_interval_secs: u64,
    /// Readings older than this many days are deleted.
    pub retention_days: u32,
    /// Sleep between retention sweeps.
    pub retention_period_secs: u64,
    /// How long shutdown waits for in-flight cleanup.
    pub drain_timeout_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15 * 60,
            retention_days: 7,
            retention_period_secs: 24 * 60 * 60,
            drain_timeout_secs: 15,
        }
    }
}

impl ScheduleConfig {
    /// Sleep between poll cycles.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Age beyond which readings are deleted.
    #[must_use]
    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    /// Sleep between retention sweeps.
    #[must_use]
    pub const fn retention_period(&self) -> Duration {
        Duration::from_secs(self.retention_period_secs)
    }

    /// Shutdown drain deadline.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_data_dir().join("sensor_data.db"),
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Whether to serve the HTTP query API.
    pub enabled: bool,
    /// Listen address.
    pub bind_address: String,
    /// IANA timezone used to render timestamps.
    pub timezone: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:3040".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parsed listen address.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the address does not parse.
    pub fn socket_addr(&self) -> ConfigResult<SocketAddr> {
        self.bind_address
            .parse()
            .map_err(|_| ConfigError::ValidationError {
                field: "server.bind_address".to_string(),
                message: format!("'{}' is not a socket address", self.bind_address),
            })
    }

    /// Parsed display timezone.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the name is not a known IANA zone.
    pub fn tz(&self) -> ConfigResult<Tz> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::ValidationError {
                field: "server.timezone".to_string(),
                message: format!("'{}' is not an IANA timezone", self.timezone),
            })
    }
}

impl HygrologConfig {
    /// Load from `path` layered with environment overrides.
    ///
    /// A missing file yields defaults (plus overrides).
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::load_layered(path.as_ref(), environment())
    }

    fn load_layered(path: &Path, env: Environment) -> ConfigResult<Self> {
        let settings = config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(env)
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Load from the path in `HYGROLOG_CONFIG`, or the platform default.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed.
    pub fn load() -> ConfigResult<Self> {
        Self::load_or_default(default_config_path())
    }

    /// Parse a TOML document without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed.
    pub fn from_toml_str(toml: &str) -> ConfigResult<Self> {
        let settings = config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Render as pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MultipleValidationErrors`] listing each problem.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &str, message: String| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message,
            });
        };

        if self.sensor.addresses.is_empty() {
            invalid(
                "sensor.addresses",
                "at least one sensor address is required".to_string(),
            );
        }
        for address in &self.sensor.addresses {
            if !is_valid_mac_address(address) {
                invalid(
                    "sensor.addresses",
                    format!("'{address}' is not a MAC address (expected XX:XX:XX:XX:XX:XX)"),
                );
            }
        }

        let acquisition = &self.acquisition;
        if acquisition.attempts == 0 {
            invalid("acquisition.attempts", "must be at least 1".to_string());
        }
        for (field, secs) in [
            ("acquisition.retry_delay_secs", acquisition.retry_delay_secs),
            (
                "acquisition.discovery_timeout_secs",
                acquisition.discovery_timeout_secs,
            ),
            (
                "acquisition.connect_timeout_secs",
                acquisition.connect_timeout_secs,
            ),
            (
                "acquisition.notification_timeout_secs",
                acquisition.notification_timeout_secs,
            ),
            (
                "acquisition.teardown_timeout_secs",
                acquisition.teardown_timeout_secs,
            ),
            ("schedule.poll_interval_secs", self.schedule.poll_interval_secs),
            ("schedule.retention_period_secs", self.schedule.retention_period_secs),
            ("schedule.drain_timeout_secs", self.schedule.drain_timeout_secs),
        ] {
            if secs == 0 {
                invalid(field, "must be greater than zero".to_string());
            } else if secs > MAX_DURATION_SECS {
                invalid(field, format!("must be at most {MAX_DURATION_SECS} seconds"));
            }
        }
        let retention_days = self.schedule.retention_days;
        if retention_days == 0 {
            invalid("schedule.retention_days", "must be at least 1".to_string());
        } else if retention_days > MAX_RETENTION_DAYS {
            invalid(
                "schedule.retention_days",
                format!("must be at most {MAX_RETENTION_DAYS} days"),
            );
        }

        if let Err(e) = self.server.tz() {
            errors.push(e);
        }
        if let Err(e) = self.server.socket_addr() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MultipleValidationErrors(errors))
        }
    }

    /// Resolve the single sensor to poll.
    ///
    /// Only the first configured address is used; extras are ignored with a
    /// warning.
    ///
    /// # Errors
    ///
    /// Returns a validation error if no valid address is configured.
    pub fn sensor_target(&self) -> ConfigResult<SensorTarget> {
        let first = self
            .sensor
            .addresses
            .first()
            .ok_or_else(|| ConfigError::ValidationError {
                field: "sensor.addresses".to_string(),
                message: "at least one sensor address is required".to_string(),
            })?;

        if !is_valid_mac_address(first) {
            return Err(ConfigError::ValidationError {
                field: "sensor.addresses".to_string(),
                message: format!("'{first}' is not a MAC address"),
            });
        }

        if self.sensor.addresses.len() > 1 {
            warn!(
                configured = self.sensor.addresses.len(),
                using = %first,
                "More than one sensor address configured; only the first is polled"
            );
        }

        Ok(SensorTarget {
            address: first.to_uppercase(),
            characteristic: self.sensor.characteristic,
        })
    }
}

/// `HYGROLOG__SECTION__KEY` overrides. `sensor.addresses` is comma-separated.
fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("sensor.addresses")
        .try_parsing(true)
}

/// Default config file location.
///
/// `HYGROLOG_CONFIG` wins. Otherwise `/etc/hygrolog/config.toml` on Linux,
/// and the per-user config directory elsewhere.
#[must_use]
pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/hygrolog/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "hygrolog").map_or_else(
            || PathBuf::from("config.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}

/// Default data directory.
///
/// On Raspberry Pi: `/var/lib/hygrolog/`
/// For development: the per-user data directory.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/hygrolog")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "hygrolog").map_or_else(
            || PathBuf::from("."),
            |dirs| dirs.data_dir().to_path_buf(),
        )
    }
}
