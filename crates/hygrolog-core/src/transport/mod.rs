//! The BLE transport seam.
//!
//! The acquisition state machine talks to the radio through [`Transport`].
//! Implementations only perform the primitive operations; every timeout is
//! applied by the caller.
//!
//! - [`bluez`] - BlueZ over D-Bus via `bluer` (feature `bluetooth`)
//! - [`mock`] - Scripted in-memory transport (feature `mock-bluetooth`, tests)

use std::future::Future;

use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

#[cfg(feature = "bluetooth")]
pub mod bluez;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;

/// Errors raised by transport primitives.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// No usable Bluetooth adapter.
    #[error("Bluetooth adapter unavailable: {message}")]
    AdapterUnavailable {
        /// Description of the failure.
        message: String,
    },

    /// The address could not be parsed by the transport.
    #[error("Invalid Bluetooth address: {address}")]
    InvalidAddress {
        /// The rejected address.
        address: String,
    },

    /// The peripheral does not expose the requested characteristic.
    #[error("Characteristic {uuid} not found on peripheral")]
    CharacteristicNotFound {
        /// The missing characteristic.
        uuid: Uuid,
    },

    /// Any other failure reported by the underlying stack.
    #[error("Bluetooth operation failed: {message}")]
    Operation {
        /// Description of the failure.
        message: String,
    },
}

/// Single-use sink for notification payloads.
///
/// Handed to [`Transport::subscribe`]. Only the first delivered payload
/// reaches the waiting attempt; later ones are rejected. Dropping the handler
/// without delivering tells the attempt the notification stream ended.
#[derive(Debug)]
pub struct NotificationHandler {
    tx: Option<oneshot::Sender<Vec<u8>>>,
}

impl NotificationHandler {
    /// Create a handler and the receiver the attempt awaits.
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Deliver a notification payload.
    ///
    /// Returns `true` if the payload was accepted. Returns `false` once a
    /// payload has already been accepted or the attempt stopped listening.
    pub fn deliver(&mut self, payload: Vec<u8>) -> bool {
        self.tx.take().is_some_and(|tx| tx.send(payload).is_ok())
    }

    /// Whether the handler can still accept a payload.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// Primitive BLE operations consumed by the acquisition state machine.
///
/// `unsubscribe` and `disconnect` must be idempotent and safe to call on a
/// peripheral whose connection only partially succeeded.
pub trait Transport: Send + Sync + 'static {
    /// Handle to a discovered peripheral. It doubles as the connection handle.
    type Peripheral: Send + Sync;

    /// Resolve an address to a live peripheral, scanning until it is seen.
    ///
    /// Returns `Ok(None)` if the scan ends without finding it.
    fn find_peripheral(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Option<Self::Peripheral>, TransportError>> + Send;

    /// Establish a connection to the peripheral.
    fn connect(
        &self,
        peripheral: &Self::Peripheral,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Start notifications on `characteristic`, feeding payloads to `handler`.
    fn subscribe(
        &self,
        peripheral: &Self::Peripheral,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Stop notifications on `characteristic`.
    fn unsubscribe(
        &self,
        peripheral: &Self::Peripheral,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Tear down the connection.
    fn disconnect(
        &self,
        peripheral: &Self::Peripheral,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_accepts_only_first_payload() {
        let (mut handler, rx) = NotificationHandler::channel();
        assert!(handler.is_open());
        assert!(handler.deliver(vec![1, 2, 3]));
        assert!(!handler.is_open());
        assert!(!handler.deliver(vec![4, 5, 6]));
        assert_eq!(rx.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_dropped_handler_closes_receiver() {
        let (handler, rx) = NotificationHandler::channel();
        drop(handler);
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_handler_rejects_after_receiver_dropped() {
        let (mut handler, rx) = NotificationHandler::channel();
        drop(rx);
        assert!(!handler.is_open());
        assert!(!handler.deliver(vec![1, 2, 3]));
    }
}
