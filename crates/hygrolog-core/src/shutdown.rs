//! Process-wide cancellation signal.
//!
//! Every suspension point in the poll loop races against
//! [`Shutdown::cancelled`]. Cleanup phases do not, so in-flight teardown still
//! runs after the signal fires.

use tokio::sync::watch;

/// Fires the shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cloneable view of the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl ShutdownTrigger {
    /// Create a trigger and its first listener.
    #[must_use]
    pub fn new() -> (Self, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, Shutdown { rx })
    }

    /// Signal shutdown to every listener. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Create another listener.
    #[must_use]
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    /// A listener that never fires.
    #[must_use]
    pub fn never() -> Self {
        // A dropped sender leaves `cancelled` pending forever.
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether shutdown has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been signalled.
    ///
    /// If the trigger is dropped without firing, this never resolves.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
