//! Single-slot connection manager.
//!
//! At most one device is connected process-wide. Management operations are
//! strictly serialized: while one is in flight every other call fails with
//! [`Error::Busy`] instead of waiting.
//!
//! ```text
//! Idle -> Connecting -> Authorized -> {Reading | Writing} -> Authorized -> Closing -> Idle
//!                  \-> Idle (auth error)            Closing -> Failed(reason) (close error)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use beacon_types::{DeviceInfo, MacAddress};

use crate::error::{Error, Result};
use crate::events::{DisconnectReason, EngineEvent, EventDispatcher};
use crate::traits::{CloudCredentials, ConnectTarget, DeviceConnector, DeviceLink};

/// State of the connection slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No device.
    Idle,
    /// Link opening and authenticating.
    Connecting,
    /// Connected and authorized.
    Authorized,
    /// Reading a setting before a write.
    Reading,
    /// Writing a setting.
    Writing,
    /// Link closing.
    Closing,
    /// The link failed to close cleanly.
    Failed(String),
}

impl ConnectionState {
    /// Whether a device is usable for management calls.
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized | Self::Reading | Self::Writing)
    }
}

/// Outcome of a read-modify-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The device already held the value; nothing was written.
    Unchanged,
    /// The value was written.
    Written,
}

struct Slot {
    state: ConnectionState,
    link: Option<Arc<dyn DeviceLink>>,
    info: Option<DeviceInfo>,
    /// Bumped by [`ConnectionManager::reset`] so in-flight operations do not
    /// commit into a slot that was cleared under them.
    epoch: u64,
}

/// Manager of the single connected device.
pub struct ConnectionManager {
    connector: Arc<dyn DeviceConnector>,
    events: EventDispatcher,
    connect_timeout: Option<Duration>,
    ops: Mutex<()>,
    slot: RwLock<Slot>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

type ReadFn<T> = fn(Arc<dyn DeviceLink>) -> BoxFuture<'static, Result<T>>;
type WriteFn<T> = fn(Arc<dyn DeviceLink>, T) -> BoxFuture<'static, Result<()>>;

impl ConnectionManager {
    /// Create an idle manager.
    pub fn new(
        connector: Arc<dyn DeviceConnector>,
        events: EventDispatcher,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            connector,
            events,
            connect_timeout,
            ops: Mutex::new(()),
            slot: RwLock::new(Slot {
                state: ConnectionState::Idle,
                link: None,
                info: None,
                epoch: 0,
            }),
        }
    }

    /// Current state.
    pub async fn state(&self) -> ConnectionState {
        self.slot.read().await.state.clone()
    }

    /// Snapshot of the connected device.
    pub async fn device_info(&self) -> Option<DeviceInfo> {
        self.slot.read().await.info.clone()
    }

    /// Address of the linked device, if any.
    pub async fn connected_mac(&self) -> Option<MacAddress> {
        self.slot.read().await.link.as_ref().map(|l| l.mac())
    }

    /// Connect to a device, preempting any other connected device.
    ///
    /// Connecting to the device that is already authorized returns its
    /// snapshot without reconnecting.
    pub async fn connect(
        &self,
        target: &ConnectTarget,
        credentials: Option<&CloudCredentials>,
    ) -> Result<DeviceInfo> {
        let _op = self.ops.try_lock().map_err(|_| Error::Busy)?;
        let mac = target.mac();

        let (started, current) = {
            let slot = self.slot.read().await;
            let current = slot
                .link
                .as_ref()
                .map(|l| (l.mac(), slot.state.clone(), slot.info.clone()));
            (slot.epoch, current)
        };
        if let Some((current_mac, state, info)) = current {
            if current_mac == mac && state.is_authorized() {
                if let Some(info) = info {
                    debug!(mac = %mac, "already connected");
                    return Ok(info);
                }
            }
            info!(from = %current_mac, to = %mac, "preempting connected device");
            if let Err(e) = self.close_current(DisconnectReason::Preempted).await {
                warn!(mac = %current_mac, error = %e, "preempted link did not close cleanly");
            }
        }

        let epoch = {
            let mut slot = self.slot.write().await;
            if slot.epoch != started {
                return Err(Error::Cancelled);
            }
            slot.state = ConnectionState::Connecting;
            slot.epoch
        };
        info!(mac = %mac, "connecting");

        let attempt = self.open_and_authenticate(target, credentials);
        let result = match self.connect_timeout {
            Some(bound) => match tokio::time::timeout(bound, attempt).await {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectTimeout {
                    mac: mac.to_string(),
                    duration: bound,
                }),
            },
            None => attempt.await,
        };

        let mut slot = self.slot.write().await;
        if slot.epoch != epoch {
            drop(slot);
            if let Ok((link, _)) = result {
                if let Err(e) = link.close().await {
                    debug!(mac = %mac, error = %e, "closing superseded link failed");
                }
            }
            return Err(Error::Cancelled);
        }

        match result {
            Ok((link, info)) => {
                slot.state = ConnectionState::Authorized;
                slot.link = Some(link);
                slot.info = Some(info.clone());
                drop(slot);
                info!(mac = %mac, name = %info.name, "device authorized");
                self.events.send(EngineEvent::Connected { mac });
                Ok(info)
            }
            Err(err) => {
                slot.state = ConnectionState::Idle;
                slot.link = None;
                slot.info = None;
                drop(slot);
                warn!(mac = %mac, error = %err, "connection failed");
                self.events.send(EngineEvent::ConnectFailed {
                    mac,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Disconnect the authorized device.
    pub async fn disconnect(&self) -> Result<()> {
        let _op = self.ops.try_lock().map_err(|_| Error::Busy)?;
        let epoch = {
            let slot = self.slot.read().await;
            if !slot.state.is_authorized() {
                return Err(Error::NotConnected);
            }
            slot.epoch
        };
        let closed = self.close_current(DisconnectReason::UserRequested).await;
        self.ensure_epoch(epoch).await?;
        closed
    }

    /// Write the proximity UUID if it differs from the device's.
    pub async fn write_proximity_uuid(&self, uuid: Uuid) -> Result<WriteOutcome> {
        let _op = self.ops.try_lock().map_err(|_| Error::Busy)?;
        self.read_modify_write(
            "proximityUUID",
            uuid,
            |link| Box::pin(async move { link.read_proximity_uuid().await }),
            |link, v| Box::pin(async move { link.write_proximity_uuid(v).await }),
        )
        .await
    }

    /// Write the major if it differs from the device's. Zero is rejected.
    pub async fn write_major(&self, major: u16) -> Result<WriteOutcome> {
        let _op = self.ops.try_lock().map_err(|_| Error::Busy)?;
        if major == 0 {
            return Err(Error::InvalidValue("major must be non-zero".into()));
        }
        self.read_modify_write(
            "major",
            major,
            |link| Box::pin(async move { link.read_major().await }),
            |link, v| Box::pin(async move { link.write_major(v).await }),
        )
        .await
    }

    /// Write the minor if it differs from the device's. Zero is rejected.
    pub async fn write_minor(&self, minor: u16) -> Result<WriteOutcome> {
        let _op = self.ops.try_lock().map_err(|_| Error::Busy)?;
        if minor == 0 {
            return Err(Error::InvalidValue("minor must be non-zero".into()));
        }
        self.read_modify_write(
            "minor",
            minor,
            |link| Box::pin(async move { link.read_minor().await }),
            |link, v| Box::pin(async move { link.write_minor(v).await }),
        )
        .await
    }

    /// Force the slot back to `Idle`, closing any link.
    ///
    /// Does not wait for an in-flight operation; that operation observes the
    /// reset and gives up with [`Error::Cancelled`].
    pub async fn reset(&self) {
        let link = {
            let mut slot = self.slot.write().await;
            slot.epoch += 1;
            slot.info = None;
            let link = slot.link.take();
            slot.state = if link.is_some() {
                ConnectionState::Closing
            } else {
                ConnectionState::Idle
            };
            link
        };
        if let Some(link) = link {
            let mac = link.mac();
            if let Err(e) = link.close().await {
                warn!(mac = %mac, error = %e, "link did not close cleanly on reset");
            }
            self.slot.write().await.state = ConnectionState::Idle;
            self.events.send(EngineEvent::Disconnected {
                mac,
                reason: DisconnectReason::Reset,
            });
            info!(mac = %mac, "connection reset");
        }
    }

    async fn open_and_authenticate(
        &self,
        target: &ConnectTarget,
        credentials: Option<&CloudCredentials>,
    ) -> Result<(Arc<dyn DeviceLink>, DeviceInfo)> {
        let link = self.connector.open(target, credentials).await?;
        match link.authenticate().await {
            Ok(info) => Ok((link, info)),
            Err(err) => {
                if let Err(e) = link.close().await {
                    debug!(error = %e, "closing unauthenticated link failed");
                }
                Err(match err {
                    Error::AuthFailed(_) | Error::ConnectTimeout { .. } => err,
                    other => Error::AuthFailed(other.to_string()),
                })
            }
        }
    }

    /// Close the linked device: `Closing -> Idle`, or `Failed` if the link errors.
    ///
    /// A reset that lands while the link is closing leaves the slot to the
    /// reset and reports the close as a [`DisconnectReason::Reset`].
    async fn close_current(&self, reason: DisconnectReason) -> Result<()> {
        let (link, epoch) = {
            let mut slot = self.slot.write().await;
            let epoch = slot.epoch;
            slot.info = None;
            match slot.link.take() {
                Some(link) => {
                    slot.state = ConnectionState::Closing;
                    (link, epoch)
                }
                None => {
                    slot.state = ConnectionState::Idle;
                    return Ok(());
                }
            }
        };

        let mac = link.mac();
        info!(mac = %mac, ?reason, "closing link");
        let closed = link.close().await;
        if self.slot.read().await.epoch != epoch {
            if let Err(e) = &closed {
                warn!(mac = %mac, error = %e, "link did not close cleanly on reset");
            }
            self.events.send(EngineEvent::Disconnected {
                mac,
                reason: DisconnectReason::Reset,
            });
            return Err(Error::Cancelled);
        }
        match closed {
            Ok(()) => {
                self.slot.write().await.state = ConnectionState::Idle;
                self.events.send(EngineEvent::Disconnected { mac, reason });
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                self.slot.write().await.state = ConnectionState::Failed(message.clone());
                self.events.send(EngineEvent::Disconnected {
                    mac,
                    reason: DisconnectReason::LinkError(message),
                });
                Err(err)
            }
        }
    }

    async fn read_modify_write<T>(
        &self,
        field: &'static str,
        value: T,
        read: ReadFn<T>,
        write: WriteFn<T>,
    ) -> Result<WriteOutcome>
    where
        T: PartialEq + Copy + fmt::Display + Send + 'static,
    {
        let (link, epoch) = {
            let mut slot = self.slot.write().await;
            let link = match (&slot.state, &slot.link) {
                (ConnectionState::Authorized, Some(link)) => Arc::clone(link),
                _ => return Err(Error::NotConnected),
            };
            slot.state = ConnectionState::Reading;
            (link, slot.epoch)
        };

        let current = read(Arc::clone(&link)).await;
        self.ensure_epoch(epoch).await?;
        let current = match current {
            Ok(current) => current,
            Err(err) => {
                self.restore_authorized(epoch).await;
                return Err(err);
            }
        };
        if current == value {
            self.restore_authorized(epoch).await;
            debug!(field, %value, "value unchanged, skipping write");
            return Ok(WriteOutcome::Unchanged);
        }

        self.set_state_if(epoch, ConnectionState::Writing).await;
        let written = write(link, value).await;
        self.ensure_epoch(epoch).await?;
        self.restore_authorized(epoch).await;
        match written {
            Ok(()) => {
                info!(field, %value, "setting written");
                Ok(WriteOutcome::Written)
            }
            Err(err @ Error::WriteFailed { .. }) => Err(err),
            Err(other) => Err(Error::write_failed(field, other.to_string())),
        }
    }

    /// Fail with [`Error::Cancelled`] if a reset happened since `epoch`.
    async fn ensure_epoch(&self, epoch: u64) -> Result<()> {
        if self.slot.read().await.epoch != epoch {
            debug!("management operation overtaken by reset");
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn restore_authorized(&self, epoch: u64) {
        self.set_state_if(epoch, ConnectionState::Authorized).await;
    }

    async fn set_state_if(&self, epoch: u64, state: ConnectionState) {
        let mut slot = self.slot.write().await;
        if slot.epoch == epoch {
            slot.state = state;
        }
    }
}
