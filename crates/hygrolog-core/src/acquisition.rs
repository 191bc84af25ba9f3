//! One acquisition attempt against the configured sensor.
//!
//! An attempt walks a fixed sequence of phases:
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Subscribing -> AwaitingNotification
//!      -> Unsubscribing -> Disconnecting -> Done
//! ```
//!
//! Every blocking phase has a mandatory timeout and also races the shutdown
//! signal. Once a phase acquires a resource, its teardown phase runs on
//! every exit path. Teardown errors are logged and never change the outcome.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::SensorTarget;
use crate::reading::{parse_reading, Reading};
use crate::shutdown::Shutdown;
use crate::transport::{NotificationHandler, Transport, TransportError};

/// Result of a single acquisition attempt.
pub type AcquisitionOutcome = Result<Reading, AcquisitionFailure>;

/// Phases of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptPhase {
    /// Not started.
    Idle,
    /// Resolving the sensor address to a live peripheral.
    Scanning,
    /// Establishing the link.
    Connecting,
    /// Enabling notifications on the data characteristic.
    Subscribing,
    /// Waiting for the first notification.
    AwaitingNotification,
    /// Disabling notifications.
    Unsubscribing,
    /// Tearing down the link.
    Disconnecting,
    /// Finished.
    Done,
}

impl AttemptPhase {
    /// Stable lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::AwaitingNotification => "awaiting_notification",
            Self::Unsubscribing => "unsubscribing",
            Self::Disconnecting => "disconnecting",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an attempt produced no reading.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcquisitionFailure {
    /// The sensor was not seen before the discovery timeout.
    #[error("Device {address} not found. Ensure the sensor is powered on and within range.")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// The link could not be established.
    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed {
        /// The sensor address.
        address: String,
        /// What went wrong.
        reason: String,
    },

    /// Subscribed, but no notification arrived in time.
    #[error("No notification from {address} within {} seconds", .waited.as_secs())]
    NotificationTimeout {
        /// The sensor address.
        address: String,
        /// How long the attempt waited.
        waited: Duration,
    },

    /// The transport failed mid-attempt.
    #[error("Transport error while {phase}: {message}")]
    TransportError {
        /// Phase in which the error surfaced.
        phase: AttemptPhase,
        /// Description of the failure.
        message: String,
    },

    /// The first notification was too short to decode.
    #[error("Malformed payload: expected at least 3 bytes, got {len}")]
    MalformedPayload {
        /// Length of the rejected payload.
        len: usize,
    },

    /// Shutdown was signalled while the attempt was suspended.
    #[error("Attempt cancelled while {phase}")]
    Cancelled {
        /// Phase that was interrupted.
        phase: AttemptPhase,
    },
}

impl AcquisitionFailure {
    /// Returns `true` if the failure came from the shutdown signal.
    #[inline]
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns a machine-readable failure code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::DeviceNotFound { .. } => "DEVICE_NOT_FOUND",
            Self::ConnectFailed { .. } => "CONNECT_FAILED",
            Self::NotificationTimeout { .. } => "NOTIFICATION_TIMEOUT",
            Self::TransportError { .. } => "TRANSPORT_ERROR",
            Self::MalformedPayload { .. } => "MALFORMED_PAYLOAD",
            Self::Cancelled { .. } => "CANCELLED",
        }
    }
}

/// Per-phase time limits for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTimeouts {
    /// Limit on resolving the address.
    pub discovery: Duration,
    /// Limit on connecting and subscribing together.
    pub connect: Duration,
    /// Limit on waiting for the first notification.
    pub notification: Duration,
    /// Limit on each teardown step.
    pub teardown: Duration,
}

impl Default for AttemptTimeouts {
    fn default() -> Self {
        Self {
            discovery: Duration::from_secs(10),
            connect: Duration::from_secs(20),
            notification: Duration::from_secs(10),
            teardown: Duration::from_secs(5),
        }
    }
}

impl AttemptTimeouts {
    /// Longest an attempt can take, teardown included.
    #[must_use]
    pub const fn worst_case(&self) -> Duration {
        self.discovery
            .saturating_add(self.connect)
            .saturating_add(self.notification)
            .saturating_add(self.teardown.saturating_mul(2))
    }
}

/// Stand-in deadline for limits too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + limit`, clamped so huge limits never overflow the clock.
fn deadline_after(limit: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(limit).unwrap_or_else(|| now + FAR_FUTURE)
}

enum Bounded<T> {
    Completed(T),
    TimedOut,
    Cancelled,
}

/// Race `fut` against `deadline` and the shutdown signal.
async fn bounded<F: Future>(
    deadline: Instant,
    shutdown: &Shutdown,
    fut: F,
) -> Bounded<F::Output> {
    tokio::select! {
        biased;
        () = shutdown.cancelled() => Bounded::Cancelled,
        result = timeout_at(deadline, fut) => {
            result.map_or(Bounded::TimedOut, Bounded::Completed)
        }
    }
}

/// Runs acquisition attempts against one sensor over one transport.
#[derive(Debug)]
pub struct Acquirer<T> {
    transport: T,
    target: SensorTarget,
    timeouts: AttemptTimeouts,
}

impl<T: Transport> Acquirer<T> {
    /// Create an acquirer.
    pub const fn new(transport: T, target: SensorTarget, timeouts: AttemptTimeouts) -> Self {
        Self {
            transport,
            target,
            timeouts,
        }
    }

    /// The transport in use.
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// The sensor being polled.
    pub const fn target(&self) -> &SensorTarget {
        &self.target
    }

    /// The configured phase timeouts.
    pub const fn timeouts(&self) -> &AttemptTimeouts {
        &self.timeouts
    }

    /// Run one full attempt and return its outcome.
    ///
    /// Never runs longer than [`AttemptTimeouts::worst_case`].
    pub async fn acquire(&self, shutdown: &Shutdown) -> AcquisitionOutcome {
        let address = self.target.address.as_str();
        debug!(%address, phase = %AttemptPhase::Idle, "Starting acquisition attempt");

        enter(AttemptPhase::Scanning);
        info!(%address, "Scanning for device");
        let deadline = deadline_after(self.timeouts.discovery);
        let scan = self.transport.find_peripheral(address);
        let peripheral = match bounded(deadline, shutdown, scan).await {
            Bounded::Completed(Ok(Some(peripheral))) => peripheral,
            Bounded::Completed(Ok(None)) | Bounded::TimedOut => {
                warn!(
                    %address,
                    timeout_secs = self.timeouts.discovery.as_secs(),
                    "Device not found"
                );
                return Err(AcquisitionFailure::DeviceNotFound {
                    address: address.to_string(),
                });
            }
            Bounded::Completed(Err(e)) => {
                warn!(%address, error = %e, "Scan failed");
                return Err(transport_failure(AttemptPhase::Scanning, &e));
            }
            Bounded::Cancelled => {
                return Err(AcquisitionFailure::Cancelled {
                    phase: AttemptPhase::Scanning,
                });
            }
        };

        let outcome = self.exchange(&peripheral, shutdown).await;

        self.teardown(AttemptPhase::Disconnecting, self.transport.disconnect(&peripheral))
            .await;
        debug!(%address, phase = %AttemptPhase::Done, ok = outcome.is_ok(), "Attempt finished");

        outcome
    }

    /// Connecting through Unsubscribing. The caller disconnects.
    async fn exchange(
        &self,
        peripheral: &T::Peripheral,
        shutdown: &Shutdown,
    ) -> AcquisitionOutcome {
        let address = self.target.address.as_str();
        let characteristic = self.target.characteristic;
        // Connecting and subscribing share one budget.
        let deadline = deadline_after(self.timeouts.connect);

        enter(AttemptPhase::Connecting);
        let connect = self.transport.connect(peripheral);
        match bounded(deadline, shutdown, connect).await {
            Bounded::Completed(Ok(())) => {}
            Bounded::Completed(Err(e)) => {
                warn!(%address, error = %e, "Connection failed");
                return Err(AcquisitionFailure::ConnectFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                });
            }
            Bounded::TimedOut => {
                warn!(
                    %address,
                    timeout_secs = self.timeouts.connect.as_secs(),
                    "Connection timed out"
                );
                return Err(AcquisitionFailure::ConnectFailed {
                    address: address.to_string(),
                    reason: format!(
                        "timed out after {} seconds",
                        self.timeouts.connect.as_secs()
                    ),
                });
            }
            Bounded::Cancelled => {
                return Err(AcquisitionFailure::Cancelled {
                    phase: AttemptPhase::Connecting,
                });
            }
        }

        enter(AttemptPhase::Subscribing);
        info!(%address, %characteristic, "Connected, starting notifications");
        let (handler, rx) = NotificationHandler::channel();
        let subscribed = bounded(
            deadline,
            shutdown,
            self.transport.subscribe(peripheral, characteristic, handler),
        )
        .await;
        let outcome = match subscribed {
            Bounded::Completed(Ok(())) => self.await_notification(rx, shutdown).await,
            Bounded::Completed(Err(e)) => {
                warn!(%address, error = %e, "Subscription failed");
                return Err(transport_failure(AttemptPhase::Subscribing, &e));
            }
            // The subscription may have landed before the deadline or the
            // signal; unsubscribe is idempotent, so fall through to it.
            Bounded::TimedOut => {
                warn!(%address, "Subscription timed out");
                Err(AcquisitionFailure::TransportError {
                    phase: AttemptPhase::Subscribing,
                    message: "timed out enabling notifications".to_string(),
                })
            }
            Bounded::Cancelled => Err(AcquisitionFailure::Cancelled {
                phase: AttemptPhase::Subscribing,
            }),
        };

        self.teardown(
            AttemptPhase::Unsubscribing,
            self.transport.unsubscribe(peripheral, characteristic),
        )
        .await;

        outcome
    }

    async fn await_notification(
        &self,
        rx: oneshot::Receiver<Vec<u8>>,
        shutdown: &Shutdown,
    ) -> AcquisitionOutcome {
        let address = self.target.address.as_str();
        enter(AttemptPhase::AwaitingNotification);

        let deadline = deadline_after(self.timeouts.notification);
        match bounded(deadline, shutdown, rx).await {
            Bounded::Completed(Ok(payload)) => {
                let reading = parse_reading(&payload, Utc::now());
                match &reading {
                    Ok(r) => info!(
                        %address,
                        temperature = r.temperature_celsius(),
                        humidity = r.humidity_percent(),
                        "Received reading"
                    ),
                    Err(e) => warn!(%address, error = %e, "Discarding malformed notification"),
                }
                reading
            }
            Bounded::Completed(Err(_)) => {
                warn!(%address, "Notification stream ended before any data arrived");
                Err(AcquisitionFailure::TransportError {
                    phase: AttemptPhase::AwaitingNotification,
                    message: "notification stream ended before any data arrived".to_string(),
                })
            }
            Bounded::TimedOut => {
                warn!(
                    %address,
                    timeout_secs = self.timeouts.notification.as_secs(),
                    "Timed out waiting for notification"
                );
                Err(AcquisitionFailure::NotificationTimeout {
                    address: address.to_string(),
                    waited: self.timeouts.notification,
                })
            }
            Bounded::Cancelled => Err(AcquisitionFailure::Cancelled {
                phase: AttemptPhase::AwaitingNotification,
            }),
        }
    }

    /// Run a cleanup step. Not raced against shutdown.
    async fn teardown<F>(&self, phase: AttemptPhase, step: F)
    where
        F: Future<Output = Result<(), TransportError>>,
    {
        let address = self.target.address.as_str();
        enter(phase);
        match timeout(self.timeouts.teardown, step).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%address, %phase, error = %e, "Cleanup step failed"),
            Err(_) => warn!(
                %address,
                %phase,
                timeout_secs = self.timeouts.teardown.as_secs(),
                "Cleanup step timed out"
            ),
        }
    }
}

fn enter(phase: AttemptPhase) {
    debug!(%phase, "Entering phase");
}

fn transport_failure(phase: AttemptPhase, err: &TransportError) -> AcquisitionFailure {
    AcquisitionFailure::TransportError {
        phase,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CHARACTERISTIC;
    use crate::shutdown::ShutdownTrigger;
    use crate::testing::{target, ADDRESS};
    use crate::transport::mock::{MockBehavior, MockTransport};

    fn acquirer(mock: &MockTransport) -> Acquirer<MockTransport> {
        Acquirer::new(mock.clone(), target(), AttemptTimeouts::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_attempt_walks_every_phase() {
        let mock = MockTransport::scripted([MockBehavior::Push(vec![vec![0x0A, 0x0B, 0x50]])]);
        let reading = acquirer(&mock).acquire(&Shutdown::never()).await.unwrap();

        assert!((reading.temperature_celsius() - 28.26).abs() < 1e-9);
        assert_eq!(reading.humidity_percent(), 80);

        let calls = mock.calls();
        assert_eq!(calls.find, 1);
        assert_eq!(calls.connect, 1);
        assert_eq!(calls.subscribe, 1);
        assert_eq!(calls.unsubscribe, 1);
        assert_eq!(calls.disconnect, 1);
        assert_eq!(mock.last_characteristic(), Some(DEFAULT_CHARACTERISTIC));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_first_notification_is_consumed() {
        let mock = MockTransport::scripted([MockBehavior::Push(vec![
            vec![0x10, 0x09, 0x37],
            vec![0xFF, 0x7F, 0x00],
        ])]);
        let reading = acquirer(&mock).acquire(&Shutdown::never()).await.unwrap();

        assert!((reading.temperature_celsius() - 23.2).abs() < 1e-9);
        assert_eq!(reading.humidity_percent(), 55);
        let calls = mock.calls();
        assert_eq!(calls.accepted, 1);
        assert_eq!(calls.rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_skips_teardown() {
        let mock = MockTransport::scripted([MockBehavior::NotFound]);
        let err = acquirer(&mock)
            .acquire(&Shutdown::never())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AcquisitionFailure::DeviceNotFound { ref address } if address == ADDRESS
        ));
        let calls = mock.calls();
        assert_eq!(calls.connect, 0);
        assert_eq!(calls.unsubscribe, 0);
        assert_eq!(calls.disconnect, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout_is_device_not_found() {
        let mock = MockTransport::scripted([MockBehavior::HangScan]);
        let started = Instant::now();
        let err = acquirer(&mock)
            .acquire(&Shutdown::never())
            .await
            .unwrap_err();

        assert!(matches!(err, AcquisitionFailure::DeviceNotFound { .. }));
        assert_eq!(started.elapsed(), AttemptTimeouts::default().discovery);
        assert_eq!(mock.calls().disconnect, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_error_is_transport_error() {
        let mock = MockTransport::scripted([MockBehavior::ScanError]);
        let err = acquirer(&mock)
            .acquire(&Shutdown::never())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AcquisitionFailure::TransportError {
                phase: AttemptPhase::Scanning,
                ..
            }
        ));
        assert_eq!(mock.calls().disconnect, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_runs_once_for_every_post_scan_failure() {
        let cases = [
            (MockBehavior::FailConnect, "CONNECT_FAILED", 0),
            (MockBehavior::HangConnect, "CONNECT_FAILED", 0),
            (MockBehavior::FailSubscribe, "TRANSPORT_ERROR", 0),
            (MockBehavior::HangSubscribe, "TRANSPORT_ERROR", 1),
            (MockBehavior::Silent, "NOTIFICATION_TIMEOUT", 1),
            (MockBehavior::DropStream, "TRANSPORT_ERROR", 1),
            (MockBehavior::Push(vec![vec![0x01, 0x02]]), "MALFORMED_PAYLOAD", 1),
        ];

        for (behavior, code, unsubscribes) in cases {
            let mock = MockTransport::scripted([behavior.clone()]);
            let err = acquirer(&mock)
            .acquire(&Shutdown::never())
            .await
            .unwrap_err();

            assert_eq!(err.error_code(), code, "behavior {behavior:?}");
            let calls = mock.calls();
            assert_eq!(calls.disconnect, 1, "behavior {behavior:?}");
            assert_eq!(calls.unsubscribe, unsubscribes, "behavior {behavior:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_timeout_waits_full_window() {
        let mock = MockTransport::scripted([MockBehavior::Silent]);
        let timeouts = AttemptTimeouts::default();
        let started = Instant::now();
        let err = acquirer(&mock)
            .acquire(&Shutdown::never())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AcquisitionFailure::NotificationTimeout { waited, .. }
                if waited == timeouts.notification
        ));
        assert_eq!(started.elapsed(), timeouts.notification);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_notification_within_window_succeeds() {
        let mock = MockTransport::scripted([MockBehavior::PushAfter(
            Duration::from_secs(9),
            vec![0x00, 0x00, 0x32],
        )]);
        let reading = acquirer(&mock).acquire(&Shutdown::never()).await.unwrap();
        assert_eq!(reading.humidity_percent(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_wait_still_tears_down() {
        let mock = MockTransport::scripted([MockBehavior::Silent]);
        let (trigger, shutdown) = ShutdownTrigger::new();
        let acquirer = acquirer(&mock);

        let attempt = acquirer.acquire(&shutdown);
        let fire = async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.trigger();
        };
        let (outcome, ()) = tokio::join!(attempt, fire);

        assert!(matches!(
            outcome,
            Err(AcquisitionFailure::Cancelled {
                phase: AttemptPhase::AwaitingNotification
            })
        ));
        let calls = mock.calls();
        assert_eq!(calls.unsubscribe, 1);
        assert_eq!(calls.disconnect, 1);
    }

    async fn cancel_after(mock: &MockTransport, secs: u64) -> AcquisitionOutcome {
        let (trigger, shutdown) = ShutdownTrigger::new();
        let acquirer = acquirer(mock);
        let fire = async {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            trigger.trigger();
        };
        let (outcome, ()) = tokio::join!(acquirer.acquire(&shutdown), fire);
        outcome
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_scan_needs_no_teardown() {
        let mock = MockTransport::scripted([MockBehavior::HangScan]);
        let started = Instant::now();

        let outcome = cancel_after(&mock, 2).await;

        assert!(matches!(
            outcome,
            Err(AcquisitionFailure::Cancelled {
                phase: AttemptPhase::Scanning
            })
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        let calls = mock.calls();
        assert_eq!(calls.connect, 0);
        assert_eq!(calls.disconnect, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_connect_still_disconnects() {
        let mock = MockTransport::scripted([MockBehavior::HangConnect]);
        let started = Instant::now();

        let outcome = cancel_after(&mock, 3).await;

        assert!(matches!(
            outcome,
            Err(AcquisitionFailure::Cancelled {
                phase: AttemptPhase::Connecting
            })
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        let calls = mock.calls();
        assert_eq!(calls.subscribe, 0);
        assert_eq!(calls.unsubscribe, 0);
        assert_eq!(calls.disconnect, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeouts_do_not_overflow_the_clock() {
        let timeouts = AttemptTimeouts {
            discovery: Duration::MAX,
            connect: Duration::MAX,
            notification: Duration::MAX,
            teardown: Duration::MAX,
        };
        let mock = MockTransport::simulated_sensor();
        let acquirer = Acquirer::new(mock.clone(), target(), timeouts);

        let reading = acquirer.acquire(&Shutdown::never()).await.unwrap();

        assert_eq!(reading.humidity_percent(), 80);
        assert_eq!(mock.calls().disconnect, 1);
        assert_eq!(timeouts.worst_case(), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_teardown_keeps_outcome() {
        let mock = MockTransport::scripted([MockBehavior::Push(vec![vec![0x0A, 0x0B, 0x50]])]);
        mock.fail_teardown(true);
        let reading = acquirer(&mock).acquire(&Shutdown::never()).await;

        assert!(reading.is_ok());
        assert_eq!(mock.calls().disconnect, 1);
    }

    #[test]
    fn test_worst_case_sums_phases() {
        let timeouts = AttemptTimeouts::default();
        assert_eq!(timeouts.worst_case(), Duration::from_secs(10 + 20 + 10 + 2 * 5));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(AttemptPhase::AwaitingNotification.to_string(), "awaiting_notification");
        assert_eq!(AttemptPhase::Done.to_string(), "done");
    }
}
