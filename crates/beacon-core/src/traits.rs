//! Trait abstractions for the collaborators the engine drives.
//!
//! The engine never talks to a BLE stack directly. It consumes these narrow
//! seams so that the same state machines run over `btleplug`
//! ([`crate::btle`]), over a mobile platform binding, or over the mocks in
//! [`crate::mock`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use beacon_types::{Beacon, ConfigurableDevice, DeviceInfo, MacAddress, Region};

use crate::error::Result;
use crate::events::ScannerEvent;

/// The single shared BLE scanner.
///
/// Callbacks are delivered as [`ScannerEvent`]s on the channel returned by
/// [`subscribe`](Self::subscribe). Start/stop calls only change what the
/// scanner looks for; they never deliver results inline.
///
/// # Example
///
/// ```ignore
/// use beacon_core::{BeaconScanner, Result};
/// use beacon_types::Region;
///
/// async fn range_everything<S: BeaconScanner>(scanner: &S) -> Result<()> {
///     scanner.connect().await?;
///     scanner.start_ranging(&Region::any("all")).await
/// }
/// ```
#[async_trait]
pub trait BeaconScanner: Send + Sync {
    // --- Lifecycle ---

    /// Bind to the scanning service and wait until it is ready.
    async fn connect(&self) -> Result<()>;

    /// Release the scanning service.
    async fn disconnect(&self) -> Result<()>;

    // --- Ranging ---

    /// Start periodic ranging of a region.
    async fn start_ranging(&self, region: &Region) -> Result<()>;

    /// Stop ranging a region.
    async fn stop_ranging(&self, region: &Region) -> Result<()>;

    // --- Monitoring ---

    /// Start edge monitoring of a region.
    async fn start_monitoring(&self, region: &Region) -> Result<()>;

    /// Stop monitoring the region with the given identifier.
    async fn stop_monitoring(&self, identifier: &str) -> Result<()>;

    // --- Discovery ---

    /// Start reporting configurable devices.
    async fn start_discovery(&self) -> Result<()>;

    /// Stop reporting configurable devices.
    async fn stop_discovery(&self) -> Result<()>;

    /// Start reporting nearables.
    async fn start_nearable_discovery(&self) -> Result<()>;

    /// Stop reporting nearables.
    async fn stop_nearable_discovery(&self) -> Result<()>;

    /// Receive scanner callbacks.
    fn subscribe(&self) -> broadcast::Receiver<ScannerEvent>;
}

/// Power state of the local Bluetooth radio.
#[async_trait]
pub trait BluetoothRadio: Send + Sync {
    /// Whether the radio is currently powered on.
    async fn is_powered(&self) -> Result<bool>;
}

/// Raises the host's "turn on Bluetooth" dialog.
///
/// The user's answer does not come back through this call. The host reports
/// it later via [`AdapterGate::on_activity_result`](crate::adapter::AdapterGate::on_activity_result).
#[async_trait]
pub trait EnablePrompt: Send + Sync {
    /// Show the dialog.
    async fn request_enable(&self) -> Result<()>;
}

/// Opaque cloud credential pair used to authorize device connections.
#[derive(Clone, PartialEq, Eq)]
pub struct CloudCredentials {
    /// Application identifier.
    pub app_id: String,
    /// Application token.
    pub app_token: String,
}

impl CloudCredentials {
    /// Create a credential pair.
    pub fn new(app_id: impl Into<String>, app_token: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_token: app_token.into(),
        }
    }
}

impl fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("app_id", &self.app_id)
            .field("app_token", &"<redacted>")
            .finish()
    }
}

/// What a connection is opened against.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectTarget {
    /// A beacon from the ranging cache.
    Beacon(Beacon),
    /// A configurable device from the discovery list.
    Device(ConfigurableDevice),
}

impl ConnectTarget {
    /// Address of the target.
    pub fn mac(&self) -> MacAddress {
        match self {
            Self::Beacon(beacon) => beacon.mac,
            Self::Device(device) => device.mac,
        }
    }
}

/// Opens management links to devices.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Open a link. The link is not yet authorized.
    async fn open(
        &self,
        target: &ConnectTarget,
        credentials: Option<&CloudCredentials>,
    ) -> Result<Arc<dyn DeviceLink>>;
}

/// A management link to a single device.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Address of the connected device.
    fn mac(&self) -> MacAddress;

    /// Authenticate and return the device snapshot.
    async fn authenticate(&self) -> Result<DeviceInfo>;

    // --- Settings ---

    /// Read the advertised proximity UUID.
    async fn read_proximity_uuid(&self) -> Result<Uuid>;

    /// Write the advertised proximity UUID.
    async fn write_proximity_uuid(&self, uuid: Uuid) -> Result<()>;

    /// Read the advertised major.
    async fn read_major(&self) -> Result<u16>;

    /// Write the advertised major.
    async fn write_major(&self, major: u16) -> Result<()>;

    /// Read the advertised minor.
    async fn read_minor(&self) -> Result<u16>;

    /// Write the advertised minor.
    async fn write_minor(&self, minor: u16) -> Result<()>;

    /// Close the link.
    async fn close(&self) -> Result<()>;
}
