//! # hygrolog-core
//!
//! Core acquisition logic for the hygrolog temperature/humidity logger.
//!
//! This crate provides:
//! - A BLE acquisition state machine that pulls one reading per attempt
//! - Bounded retries and a fixed polling cadence around that state machine
//! - A daily retention sweep over persisted readings
//! - SQLite persistence for readings
//! - Configuration loading and validation
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`reading`] - Notification payload decoding into [`Reading`]s
//! - [`transport`] - The BLE transport seam, with BlueZ and mock adapters
//! - [`acquisition`] - One discover/connect/subscribe/await/teardown attempt
//! - [`collector`] - Retry coordinator wrapping attempts and the sink hand-off
//! - [`scheduler`] - Poll and retention loops
//! - [`storage`] - Persistence sink and query surface
//! - [`shutdown`] - Process-wide cancellation signal
//! - [`config`] - Application configuration loading and validation
//! - [`error`] - Unified error types for the crate

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod acquisition;
pub mod collector;
pub mod config;
pub mod error;
pub mod reading;
pub mod scheduler;
pub mod shutdown;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export primary types for convenience
pub use acquisition::{
    AcquisitionFailure, AcquisitionOutcome, Acquirer, AttemptPhase, AttemptTimeouts,
};
pub use collector::{Collector, CycleReport, RetryPolicy};
pub use config::{
    is_valid_mac_address, AcquisitionConfig, ConfigError, ConfigResult, HygrologConfig,
    ScheduleConfig, SensorConfig, SensorTarget, ServerConfig, StorageConfig,
    DEFAULT_CHARACTERISTIC,
};
pub use error::{HygrologError, Result};
pub use reading::{parse_reading, Reading};
pub use scheduler::{run, Scheduler};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use storage::{
    run_blocking, HistoryQuery, InvalidSortOrder, ReadingSink, SortOrder, SqliteStore,
    StorageError, StoredReading,
};
#[cfg(feature = "bluetooth")]
pub use transport::bluez::BluezTransport;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub use transport::mock::{MockBehavior, MockTransport};
pub use transport::{NotificationHandler, Transport, TransportError};
