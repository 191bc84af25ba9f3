//! Scripted in-memory transport.
//!
//! Each call to `find_peripheral` pops the next [`MockBehavior`] from the
//! script and the returned peripheral carries it through the attempt. Once
//! the script is empty the fallback behavior is used. Every primitive call
//! is counted so tests can assert on teardown and overlap.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use uuid::Uuid;

use super::{NotificationHandler, Transport, TransportError};

/// What the simulated sensor does during one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// The scan finishes without seeing the device.
    NotFound,
    /// The scan never finishes.
    HangScan,
    /// The adapter reports an error while scanning.
    ScanError,
    /// The transport panics while scanning.
    PanicScan,
    /// The connection is refused.
    FailConnect,
    /// The connection never completes.
    HangConnect,
    /// Enabling notifications fails.
    FailSubscribe,
    /// Enabling notifications never completes.
    HangSubscribe,
    /// Subscribed, but the sensor never pushes anything.
    Silent,
    /// Subscribed, then each payload is pushed immediately, in order.
    Push(Vec<Vec<u8>>),
    /// Subscribed, then one payload is pushed after a delay.
    PushAfter(Duration, Vec<u8>),
    /// Subscribed, then the notification stream ends without data.
    DropStream,
}

/// Peripheral handle handed out by [`MockTransport`].
#[derive(Debug)]
pub struct MockPeripheral {
    behavior: MockBehavior,
}

/// Snapshot of call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCalls {
    /// `find_peripheral` calls.
    pub find: usize,
    /// `connect` calls.
    pub connect: usize,
    /// `subscribe` calls.
    pub subscribe: usize,
    /// `unsubscribe` calls.
    pub unsubscribe: usize,
    /// `disconnect` calls.
    pub disconnect: usize,
    /// Payloads the handler accepted.
    pub accepted: usize,
    /// Payloads the handler rejected.
    pub rejected: usize,
    /// Most connections open at the same time.
    pub peak_connections: usize,
}

#[derive(Debug)]
struct Script {
    queue: VecDeque<MockBehavior>,
    fallback: MockBehavior,
}

#[derive(Debug, Default)]
struct Counters {
    find: AtomicUsize,
    connect: AtomicUsize,
    subscribe: AtomicUsize,
    unsubscribe: AtomicUsize,
    disconnect: AtomicUsize,
    accepted: AtomicUsize,
    rejected: AtomicUsize,
    open: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Debug)]
struct Inner {
    script: Mutex<Script>,
    handler: Mutex<Option<NotificationHandler>>,
    last_characteristic: Mutex<Option<Uuid>>,
    fail_teardown: AtomicBool,
    counters: Counters,
}

/// In-memory [`Transport`] driven by a script of [`MockBehavior`]s.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    /// Play `script` in order, then behave as [`MockBehavior::NotFound`].
    #[must_use]
    pub fn scripted(script: impl IntoIterator<Item = MockBehavior>) -> Self {
        Self::with_fallback(script, MockBehavior::NotFound)
    }

    /// Behave the same way on every attempt.
    #[must_use]
    pub fn always(behavior: MockBehavior) -> Self {
        Self::with_fallback([], behavior)
    }

    /// A sensor that answers every attempt with 28.26 °C / 80 % after a second.
    #[must_use]
    pub fn simulated_sensor() -> Self {
        Self::always(MockBehavior::PushAfter(
            Duration::from_secs(1),
            vec![0x0A, 0x0B, 0x50],
        ))
    }

    /// Play `script` in order, then repeat `fallback`.
    #[must_use]
    pub fn with_fallback(
        script: impl IntoIterator<Item = MockBehavior>,
        fallback: MockBehavior,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                script: Mutex::new(Script {
                    queue: script.into_iter().collect(),
                    fallback,
                }),
                handler: Mutex::new(None),
                last_characteristic: Mutex::new(None),
                fail_teardown: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// Make `unsubscribe` and `disconnect` report errors (after counting).
    pub fn fail_teardown(&self, fail: bool) {
        self.inner.fail_teardown.store(fail, Ordering::SeqCst);
    }

    /// Snapshot the call counters.
    #[must_use]
    pub fn calls(&self) -> MockCalls {
        let c = &self.inner.counters;
        MockCalls {
            find: c.find.load(Ordering::SeqCst),
            connect: c.connect.load(Ordering::SeqCst),
            subscribe: c.subscribe.load(Ordering::SeqCst),
            unsubscribe: c.unsubscribe.load(Ordering::SeqCst),
            disconnect: c.disconnect.load(Ordering::SeqCst),
            accepted: c.accepted.load(Ordering::SeqCst),
            rejected: c.rejected.load(Ordering::SeqCst),
            peak_connections: c.peak.load(Ordering::SeqCst),
        }
    }

    /// Characteristic passed to the most recent `subscribe`.
    #[must_use]
    pub fn last_characteristic(&self) -> Option<Uuid> {
        *lock(&self.inner.last_characteristic)
    }

    fn next_behavior(&self) -> MockBehavior {
        let mut script = lock(&self.inner.script);
        script
            .queue
            .pop_front()
            .unwrap_or_else(|| script.fallback.clone())
    }

    fn record_delivery(counters: &Counters, accepted: bool) {
        if accepted {
            counters.accepted.fetch_add(1, Ordering::SeqCst);
        } else {
            counters.rejected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn teardown_result(&self, step: &str) -> Result<(), TransportError> {
        if self.inner.fail_teardown.load(Ordering::SeqCst) {
            Err(TransportError::Operation {
                message: format!("simulated {step} failure"),
            })
        } else {
            Ok(())
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn simulated(message: &str) -> TransportError {
    TransportError::Operation {
        message: message.to_string(),
    }
}

impl Transport for MockTransport {
    type Peripheral = MockPeripheral;

    async fn find_peripheral(
        &self,
        _address: &str,
    ) -> Result<Option<MockPeripheral>, TransportError> {
        self.inner.counters.find.fetch_add(1, Ordering::SeqCst);
        let behavior = self.next_behavior();
        match behavior {
            MockBehavior::NotFound => Ok(None),
            MockBehavior::HangScan => std::future::pending().await,
            MockBehavior::ScanError => Err(TransportError::AdapterUnavailable {
                message: "simulated adapter failure".to_string(),
            }),
            MockBehavior::PanicScan => panic!("simulated transport fault"),
            behavior => Ok(Some(MockPeripheral { behavior })),
        }
    }

    async fn connect(&self, peripheral: &MockPeripheral) -> Result<(), TransportError> {
        let c = &self.inner.counters;
        c.connect.fetch_add(1, Ordering::SeqCst);
        // The link is "open" from the first connect until disconnect.
        let open = c.open.fetch_add(1, Ordering::SeqCst) + 1;
        c.peak.fetch_max(open, Ordering::SeqCst);

        match peripheral.behavior {
            MockBehavior::FailConnect => Err(simulated("simulated connection refusal")),
            MockBehavior::HangConnect => std::future::pending().await,
            _ => Ok(()),
        }
    }

    async fn subscribe(
        &self,
        peripheral: &MockPeripheral,
        characteristic: Uuid,
        mut handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        self.inner.counters.subscribe.fetch_add(1, Ordering::SeqCst);
        *lock(&self.inner.last_characteristic) = Some(characteristic);

        match &peripheral.behavior {
            MockBehavior::FailSubscribe => return Err(simulated("simulated notify failure")),
            MockBehavior::HangSubscribe => std::future::pending::<()>().await,
            MockBehavior::Push(payloads) => {
                for payload in payloads {
                    let accepted = handler.deliver(payload.clone());
                    Self::record_delivery(&self.inner.counters, accepted);
                }
            }
            MockBehavior::PushAfter(delay, payload) => {
                let (delay, payload) = (*delay, payload.clone());
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let accepted = handler.deliver(payload);
                    Self::record_delivery(&inner.counters, accepted);
                });
                return Ok(());
            }
            MockBehavior::DropStream => {
                drop(handler);
                return Ok(());
            }
            _ => {}
        }

        *lock(&self.inner.handler) = Some(handler);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        _peripheral: &MockPeripheral,
        _characteristic: Uuid,
    ) -> Result<(), TransportError> {
        self.inner.counters.unsubscribe.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.handler).take();
        self.teardown_result("unsubscribe")
    }

    async fn disconnect(&self, _peripheral: &MockPeripheral) -> Result<(), TransportError> {
        let c = &self.inner.counters;
        c.disconnect.fetch_add(1, Ordering::SeqCst);
        // Idempotent: never underflow if called without a connect.
        let _ = c
            .open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.teardown_result("disconnect")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let mock = MockTransport::with_fallback([MockBehavior::NotFound], MockBehavior::Silent);
        assert!(mock.find_peripheral("addr").await.unwrap().is_none());
        let peripheral = mock.find_peripheral("addr").await.unwrap().unwrap();
        assert_eq!(peripheral.behavior, MockBehavior::Silent);
        assert_eq!(mock.calls().find, 2);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mock = MockTransport::always(MockBehavior::Silent);
        let peripheral = mock.find_peripheral("addr").await.unwrap().unwrap();
        mock.disconnect(&peripheral).await.unwrap();
        mock.disconnect(&peripheral).await.unwrap();
        assert_eq!(mock.calls().disconnect, 2);
        assert_eq!(mock.calls().peak_connections, 0);
    }

    #[tokio::test]
    async fn test_push_counts_rejections() {
        let mock = MockTransport::always(MockBehavior::Push(vec![vec![1, 2, 3], vec![4, 5, 6]]));
        let peripheral = mock.find_peripheral("addr").await.unwrap().unwrap();
        let (handler, rx) = NotificationHandler::channel();
        mock.subscribe(&peripheral, Uuid::nil(), handler)
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap(), vec![1, 2, 3]);
        let calls = mock.calls();
        assert_eq!(calls.accepted, 1);
        assert_eq!(calls.rejected, 1);
    }
}
