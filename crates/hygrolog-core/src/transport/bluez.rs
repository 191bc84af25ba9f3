//! BlueZ transport via `bluer`.
//!
//! Linux only. Requires a running `bluetoothd` and access to the system
//! D-Bus.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bluer::{Adapter, AdapterEvent, Address, Device, Session};
use futures::{pin_mut, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::{NotificationHandler, Transport, TransportError};

/// Interval between checks for GATT service resolution.
const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        Self::Operation {
            message: err.to_string(),
        }
    }
}

/// [`Transport`] backed by the BlueZ D-Bus API.
pub struct BluezTransport {
    // Held so the D-Bus connection outlives the adapter handle.
    _session: Session,
    adapter: Adapter,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BluezTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluezTransport")
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

impl BluezTransport {
    /// Open a session and power on the adapter.
    ///
    /// Uses the named adapter (e.g. `hci0`) if given, otherwise the default.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AdapterUnavailable`] if BlueZ cannot be
    /// reached or the adapter cannot be powered on.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self, TransportError> {
        let unavailable = |err: bluer::Error| TransportError::AdapterUnavailable {
            message: err.to_string(),
        };

        let session = Session::new().await.map_err(unavailable)?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name).map_err(unavailable)?,
            None => session.default_adapter().await.map_err(unavailable)?,
        };
        adapter.set_powered(true).await.map_err(unavailable)?;

        info!(adapter = adapter.name(), "Bluetooth adapter ready");

        Ok(Self {
            _session: session,
            adapter,
            forwarder: Mutex::new(None),
        })
    }

    fn replace_forwarder(&self, next: Option<JoinHandle<()>>) {
        let previous = {
            let mut slot = self
                .forwarder
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, next)
        };
        if let Some(task) = previous {
            // Dropping the notify stream inside the task stops notifications.
            task.abort();
        }
    }
}

async fn wait_for_services(device: &Device) -> Result<(), TransportError> {
    while !device.is_services_resolved().await? {
        tokio::time::sleep(SERVICES_POLL_INTERVAL).await;
    }
    Ok(())
}

impl Transport for BluezTransport {
    type Peripheral = Device;

    async fn find_peripheral(&self, address: &str) -> Result<Option<Device>, TransportError> {
        let wanted: Address = address.parse().map_err(|_| TransportError::InvalidAddress {
            address: address.to_string(),
        })?;

        // Already-known devices are reported first, then new ones as they
        // are seen. Discovery stops when the stream is dropped.
        let events = self.adapter.discover_devices().await?;
        pin_mut!(events);
        while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceAdded(found) = event {
                if found == wanted {
                    debug!(%address, "Device discovered");
                    return Ok(Some(self.adapter.device(wanted)?));
                }
            }
        }

        Ok(None)
    }

    async fn connect(&self, device: &Device) -> Result<(), TransportError> {
        if !device.is_connected().await? {
            device.connect().await?;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        device: &Device,
        characteristic: Uuid,
        mut handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        wait_for_services(device).await?;

        for service in device.services().await? {
            for candidate in service.characteristics().await? {
                if candidate.uuid().await? != characteristic {
                    continue;
                }

                let notifications = candidate.notify().await?;
                let task = tokio::spawn(async move {
                    pin_mut!(notifications);
                    while let Some(payload) = notifications.next().await {
                        if !handler.deliver(payload) {
                            break;
                        }
                    }
                });
                self.replace_forwarder(Some(task));
                return Ok(());
            }
        }

        Err(TransportError::CharacteristicNotFound {
            uuid: characteristic,
        })
    }

    async fn unsubscribe(
        &self,
        _device: &Device,
        _characteristic: Uuid,
    ) -> Result<(), TransportError> {
        self.replace_forwarder(None);
        Ok(())
    }

    async fn disconnect(&self, device: &Device) -> Result<(), TransportError> {
        if device.is_connected().await? {
            device.disconnect().await?;
        }
        Ok(())
    }
}
