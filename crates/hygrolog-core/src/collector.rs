//! Retry coordinator.
//!
//! A [`Collector`] runs acquisition attempts back to back until one yields a
//! reading or the attempt budget runs out, then hands the reading to the
//! sink exactly once. Attempts never overlap. The delay between attempts is
//! constant and is only slept *between* attempts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::acquisition::{AcquisitionFailure, Acquirer};
use crate::reading::Reading;
use crate::shutdown::Shutdown;
use crate::storage::{run_blocking, ReadingSink, StorageError};
use crate::transport::Transport;

/// Attempt budget for one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per cycle. Zero is treated as one.
    pub attempts: u32,
    /// Constant pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// What one poll cycle achieved.
#[derive(Debug)]
pub enum CycleReport {
    /// A reading was acquired and stored.
    Stored {
        /// The stored reading.
        reading: Reading,
        /// Id assigned by the sink.
        record_id: i64,
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// A reading was acquired but the sink rejected it.
    StorageFailed {
        /// The reading that was lost.
        reading: Reading,
        /// Why the sink failed.
        error: StorageError,
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// Every attempt failed.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        last_failure: AcquisitionFailure,
    },
    /// Shutdown interrupted the cycle.
    Cancelled {
        /// Attempts started before cancellation.
        attempts: u32,
    },
}

impl CycleReport {
    /// Attempts made during the cycle.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Stored { attempts, .. }
            | Self::StorageFailed { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }

    /// The acquired reading, whether or not it was stored.
    #[must_use]
    pub const fn reading(&self) -> Option<&Reading> {
        match self {
            Self::Stored { reading, .. } | Self::StorageFailed { reading, .. } => Some(reading),
            Self::Exhausted { .. } | Self::Cancelled { .. } => None,
        }
    }
}

/// Retry coordinator for a single sensor.
#[derive(Debug)]
pub struct Collector<T, S> {
    acquirer: Acquirer<T>,
    sink: Arc<S>,
    policy: RetryPolicy,
}

impl<T: Transport, S: ReadingSink> Collector<T, S> {
    /// Create a collector.
    pub const fn new(acquirer: Acquirer<T>, sink: Arc<S>, policy: RetryPolicy) -> Self {
        Self {
            acquirer,
            sink,
            policy,
        }
    }

    /// The sink readings are handed to.
    pub const fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    /// The attempt runner.
    pub const fn acquirer(&self) -> &Acquirer<T> {
        &self.acquirer
    }

    /// Run one poll cycle: up to `policy.attempts` attempts, then store.
    pub async fn collect(&self, shutdown: &Shutdown) -> CycleReport {
        let address = self.acquirer.target().address.as_str();
        let budget = self.policy.attempts.max(1);
        let mut attempt = 1;

        loop {
            info!(%address, attempt, budget, "Collection attempt");
            let failure = match self.acquirer.acquire(shutdown).await {
                Ok(reading) => return self.store(reading, attempt).await,
                Err(failure) if failure.is_cancelled() => {
                    info!(%address, attempt, "Collection cancelled");
                    return CycleReport::Cancelled { attempts: attempt };
                }
                Err(failure) => failure,
            };

            warn!(
                %address,
                attempt,
                budget,
                code = failure.error_code(),
                error = %failure,
                "Collection attempt failed"
            );

            if attempt >= budget {
                error!(
                    %address,
                    attempts = attempt,
                    "Failed to collect data after all attempts. Will try again next interval."
                );
                return CycleReport::Exhausted {
                    attempts: attempt,
                    last_failure: failure,
                };
            }

            info!(delay_secs = self.policy.delay.as_secs(), "Retrying after delay");
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return CycleReport::Cancelled { attempts: attempt },
                () = tokio::time::sleep(self.policy.delay) => {}
            }
            attempt += 1;
        }
    }

    async fn store(&self, reading: Reading, attempts: u32) -> CycleReport {
        let sink = Arc::clone(&self.sink);
        match run_blocking(move || sink.append(&reading)).await {
            Ok(record_id) => {
                info!(
                    record_id,
                    temperature = reading.temperature_celsius(),
                    humidity = reading.humidity_percent(),
                    captured_at = %reading.captured_at(),
                    "Saved reading"
                );
                CycleReport::Stored {
                    reading,
                    record_id,
                    attempts,
                }
            }
            Err(error) => {
                // Acquisition and storage fail independently; no re-acquire.
                error!(%error, "Failed to store reading");
                CycleReport::StorageFailed {
                    reading,
                    error,
                    attempts,
                }
            }
        }
    }
}
