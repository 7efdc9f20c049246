//! Mock collaborators for testing.
//!
//! This module provides in-memory implementations of every seam in
//! [`crate::traits`] so the engine can be exercised without BLE hardware.
//!
//! # Features
//!
//! - **Event injection**: push ranging, monitoring and discovery callbacks
//!   through [`MockScanner`]
//! - **Failure injection**: make handshakes, scans, authentication, writes or
//!   closes fail on demand
//! - **Latency simulation**: delay handshakes and link operations
//! - **Counters**: observe how often the scanner bound and how many writes a
//!   link performed

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use beacon_types::uuid::ESTIMOTE_PROXIMITY_UUID;
use beacon_types::{
    Beacon, ConfigurableDevice, DeviceInfo, DeviceSettings, MacAddress, Nearable, Region,
};

use crate::error::{Error, Result};
use crate::events::ScannerEvent;
use crate::traits::{
    BeaconScanner, BluetoothRadio, CloudCredentials, ConnectTarget, DeviceConnector, DeviceLink,
    EnablePrompt,
};

async fn simulate_latency(ms: &AtomicU64) {
    let latency = ms.load(Ordering::Relaxed);
    if latency > 0 {
        tokio::time::sleep(Duration::from_millis(latency)).await;
    }
}

fn store_latency(ms: &AtomicU64, latency: Duration) {
    ms.store(latency.as_millis() as u64, Ordering::Relaxed);
}

// --- Scanner ---

/// A mock scanner driven by the test.
///
/// # Example
///
/// ```
/// use beacon_core::{BeaconScanner, MockScanner, ScannerEvent};
/// use beacon_types::Region;
///
/// #[tokio::main]
/// async fn main() {
///     let scanner = MockScanner::new();
///     let mut events = scanner.subscribe();
///     scanner.connect().await.unwrap();
///
///     scanner.enter(&Region::any("lobby"));
///     assert!(matches!(events.recv().await.unwrap(), ScannerEvent::Entered(_)));
/// }
/// ```
#[derive(Debug)]
pub struct MockScanner {
    sender: broadcast::Sender<ScannerEvent>,
    connected: AtomicBool,
    connect_count: AtomicU32,
    disconnect_count: AtomicU32,
    connect_latency_ms: AtomicU64,
    fail_connect: AtomicBool,
    fail_starts: AtomicBool,
    ranging: RwLock<Vec<Region>>,
    monitoring: RwLock<Vec<Region>>,
    discovering: AtomicBool,
    discovering_nearables: AtomicBool,
}

impl Default for MockScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScanner {
    /// Create an unbound scanner.
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    /// Create a scanner with the given callback channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connected: AtomicBool::new(false),
            connect_count: AtomicU32::new(0),
            disconnect_count: AtomicU32::new(0),
            connect_latency_ms: AtomicU64::new(0),
            fail_connect: AtomicBool::new(false),
            fail_starts: AtomicBool::new(false),
            ranging: RwLock::new(Vec::new()),
            monitoring: RwLock::new(Vec::new()),
            discovering: AtomicBool::new(false),
            discovering_nearables: AtomicBool::new(false),
        }
    }

    // --- Event injection ---

    /// Deliver an arbitrary callback.
    pub fn emit(&self, event: ScannerEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Deliver a ranging window.
    pub fn range(&self, region: &Region, beacons: Vec<Beacon>) {
        self.emit(ScannerEvent::Ranged {
            region: region.clone(),
            beacons,
        });
    }

    /// Deliver a region entry.
    pub fn enter(&self, region: &Region) {
        self.emit(ScannerEvent::Entered(region.clone()));
    }

    /// Deliver a region exit.
    pub fn exit(&self, region: &Region) {
        self.emit(ScannerEvent::Exited(region.clone()));
    }

    /// Deliver discovered devices.
    pub fn discover(&self, devices: Vec<ConfigurableDevice>) {
        self.emit(ScannerEvent::Discovered(devices));
    }

    /// Deliver nearables.
    pub fn nearables(&self, nearables: Vec<Nearable>) {
        self.emit(ScannerEvent::Nearables(nearables));
    }

    /// Deliver a scanner error code.
    pub fn error(&self, code: i32) {
        self.emit(ScannerEvent::Error(code));
    }

    // --- Inspection ---

    /// Whether the scanner is bound.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// How many handshakes completed.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::Relaxed)
    }

    /// How many times the scanner was released.
    pub fn disconnect_count(&self) -> u32 {
        self.disconnect_count.load(Ordering::Relaxed)
    }

    /// Regions currently ranged.
    pub async fn ranging_regions(&self) -> Vec<Region> {
        self.ranging.read().await.clone()
    }

    /// Identifiers of regions currently monitored.
    pub async fn monitored_identifiers(&self) -> Vec<String> {
        self.monitoring
            .read()
            .await
            .iter()
            .map(|r| r.identifier.clone())
            .collect()
    }

    /// Whether device discovery is running.
    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::Relaxed)
    }

    /// Whether nearable discovery is running.
    pub fn is_discovering_nearables(&self) -> bool {
        self.discovering_nearables.load(Ordering::Relaxed)
    }

    // --- Behaviour control ---

    /// Delay the service-ready handshake.
    pub fn set_connect_latency(&self, latency: Duration) {
        store_latency(&self.connect_latency_ms, latency);
    }

    /// Make the handshake fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    /// Make every start call fail.
    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::Relaxed);
    }

    fn check_start(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Scanner { code: -2 });
        }
        if self.fail_starts.load(Ordering::Relaxed) {
            return Err(Error::Scanner { code: -3 });
        }
        Ok(())
    }
}

#[async_trait]
impl BeaconScanner for MockScanner {
    async fn connect(&self) -> Result<()> {
        simulate_latency(&self.connect_latency_ms).await;
        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(Error::Scanner { code: -1 });
        }
        self.connected.store(true, Ordering::Relaxed);
        self.connect_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        self.disconnect_count.fetch_add(1, Ordering::Relaxed);
        self.ranging.write().await.clear();
        self.monitoring.write().await.clear();
        self.discovering.store(false, Ordering::Relaxed);
        self.discovering_nearables.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn start_ranging(&self, region: &Region) -> Result<()> {
        self.check_start()?;
        let mut ranging = self.ranging.write().await;
        ranging.retain(|r| r.key() != region.key());
        ranging.push(region.clone());
        Ok(())
    }

    async fn stop_ranging(&self, region: &Region) -> Result<()> {
        self.ranging.write().await.retain(|r| r.key() != region.key());
        Ok(())
    }

    async fn start_monitoring(&self, region: &Region) -> Result<()> {
        self.check_start()?;
        let mut monitoring = self.monitoring.write().await;
        monitoring.retain(|r| r.identifier != region.identifier);
        monitoring.push(region.clone());
        Ok(())
    }

    async fn stop_monitoring(&self, identifier: &str) -> Result<()> {
        self.monitoring
            .write()
            .await
            .retain(|r| r.identifier != identifier);
        Ok(())
    }

    async fn start_discovery(&self) -> Result<()> {
        self.check_start()?;
        self.discovering.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<()> {
        self.discovering.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn start_nearable_discovery(&self) -> Result<()> {
        self.check_start()?;
        self.discovering_nearables.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn stop_nearable_discovery(&self) -> Result<()> {
        self.discovering_nearables.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ScannerEvent> {
        self.sender.subscribe()
    }
}

// --- Radio and prompt ---

/// A radio whose power state the test controls.
#[derive(Debug)]
pub struct MockRadio {
    powered: AtomicBool,
}

impl MockRadio {
    /// Create a radio in the given power state.
    pub fn new(powered: bool) -> Self {
        Self {
            powered: AtomicBool::new(powered),
        }
    }

    /// Power the radio on or off.
    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::Relaxed);
    }
}

#[async_trait]
impl BluetoothRadio for MockRadio {
    async fn is_powered(&self) -> Result<bool> {
        Ok(self.powered.load(Ordering::Relaxed))
    }
}

/// An enable prompt that only counts how often it was raised.
#[derive(Debug, Default)]
pub struct MockPrompt {
    requests: AtomicU32,
    fail: AtomicBool,
}

impl MockPrompt {
    /// Create a prompt.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times the dialog was raised.
    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Make raising the dialog fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl EnablePrompt for MockPrompt {
    async fn request_enable(&self) -> Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(Error::RadioOff);
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// --- Connector and link ---

/// A mock management link.
#[derive(Debug)]
pub struct MockLink {
    mac: MacAddress,
    uuid: RwLock<Uuid>,
    major: AtomicU16,
    minor: AtomicU16,
    settings: DeviceSettings,
    closed: AtomicBool,
    read_count: AtomicU32,
    write_count: AtomicU32,
    latency_ms: AtomicU64,
    auth_latency_ms: AtomicU64,
    fail_auth: AtomicBool,
    fail_writes: AtomicBool,
    fail_close: AtomicBool,
}

impl MockLink {
    /// Create a link advertising the given identity.
    pub fn new(mac: MacAddress, uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            mac,
            uuid: RwLock::new(uuid),
            major: AtomicU16::new(major),
            minor: AtomicU16::new(minor),
            settings: DeviceSettings {
                advertising_interval_millis: 950,
                battery_level: 87,
                broadcasting_power: -12,
                firmware: "A3.2.0".to_string(),
                hardware: "D3.4".to_string(),
            },
            closed: AtomicBool::new(false),
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            auth_latency_ms: AtomicU64::new(0),
            fail_auth: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
        }
    }

    /// Create a link for a connect target.
    ///
    /// Configurable devices do not advertise an identity triple, so one is
    /// made up for them.
    pub fn for_target(target: &ConnectTarget) -> Self {
        match target {
            ConnectTarget::Beacon(beacon) => {
                Self::new(beacon.mac, beacon.proximity_uuid, beacon.major, beacon.minor)
            }
            ConnectTarget::Device(device) => Self::new(
                device.mac,
                ESTIMOTE_PROXIMITY_UUID,
                rand::random::<u16>().max(1),
                rand::random::<u16>().max(1),
            ),
        }
    }

    /// Current advertised major.
    pub fn major(&self) -> u16 {
        self.major.load(Ordering::Relaxed)
    }

    /// Current advertised minor.
    pub fn minor(&self) -> u16 {
        self.minor.load(Ordering::Relaxed)
    }

    /// Current advertised proximity UUID.
    pub async fn proximity_uuid(&self) -> Uuid {
        *self.uuid.read().await
    }

    /// Whether the link was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Number of setting reads performed.
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Number of setting writes performed.
    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Delay setting reads and writes, and closing the link.
    pub fn set_latency(&self, latency: Duration) {
        store_latency(&self.latency_ms, latency);
    }

    /// Delay authentication.
    pub fn set_auth_latency(&self, latency: Duration) {
        store_latency(&self.auth_latency_ms, latency);
    }

    /// Make authentication fail.
    pub fn set_fail_auth(&self, fail: bool) {
        self.fail_auth.store(fail, Ordering::Relaxed);
    }

    /// Make writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make closing fail.
    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::Relaxed);
    }

    async fn begin_io(&self) -> Result<()> {
        simulate_latency(&self.latency_ms).await;
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    async fn begin_read(&self) -> Result<()> {
        self.begin_io().await?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn begin_write(&self, field: &'static str) -> Result<()> {
        self.begin_io().await?;
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::write_failed(field, "mock write rejected"));
        }
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl DeviceLink for MockLink {
    fn mac(&self) -> MacAddress {
        self.mac
    }

    async fn authenticate(&self) -> Result<DeviceInfo> {
        simulate_latency(&self.auth_latency_ms).await;
        if self.fail_auth.load(Ordering::Relaxed) {
            return Err(Error::AuthFailed("mock refused credentials".to_string()));
        }
        Ok(DeviceInfo {
            battery_percentage: self.settings.battery_level,
            color: "blueberry".to_string(),
            mac: self.mac,
            major: self.major(),
            minor: self.minor(),
            name: format!("Mock {}", self.mac),
            uuid: self.proximity_uuid().await,
            settings: self.settings.clone(),
        })
    }

    async fn read_proximity_uuid(&self) -> Result<Uuid> {
        self.begin_read().await?;
        Ok(self.proximity_uuid().await)
    }

    async fn write_proximity_uuid(&self, uuid: Uuid) -> Result<()> {
        self.begin_write("proximityUUID").await?;
        *self.uuid.write().await = uuid;
        Ok(())
    }

    async fn read_major(&self) -> Result<u16> {
        self.begin_read().await?;
        Ok(self.major())
    }

    async fn write_major(&self, major: u16) -> Result<()> {
        self.begin_write("major").await?;
        self.major.store(major, Ordering::Relaxed);
        Ok(())
    }

    async fn read_minor(&self) -> Result<u16> {
        self.begin_read().await?;
        Ok(self.minor())
    }

    async fn write_minor(&self, minor: u16) -> Result<()> {
        self.begin_write("minor").await?;
        self.minor.store(minor, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        simulate_latency(&self.latency_ms).await;
        if self.fail_close.load(Ordering::Relaxed) {
            self.closed.store(true, Ordering::Relaxed);
            return Err(Error::write_failed("close", "mock link close failed"));
        }
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// A connector that opens [`MockLink`]s and remembers them by address.
#[derive(Debug, Default)]
pub struct MockConnector {
    links: RwLock<HashMap<MacAddress, Arc<MockLink>>>,
    open_count: AtomicU32,
    fail_open: AtomicBool,
    fail_auth: AtomicBool,
    auth_latency_ms: AtomicU64,
    last_credentials: RwLock<Option<CloudCredentials>>,
}

impl MockConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent link opened to an address.
    pub async fn link(&self, mac: &MacAddress) -> Option<Arc<MockLink>> {
        self.links.read().await.get(mac).cloned()
    }

    /// Number of links opened.
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Relaxed)
    }

    /// Credentials passed to the most recent open.
    pub async fn last_credentials(&self) -> Option<CloudCredentials> {
        self.last_credentials.read().await.clone()
    }

    /// Make opening fail as if the device were out of range.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Relaxed);
    }

    /// Make links opened from now on refuse authentication.
    pub fn set_fail_auth(&self, fail: bool) {
        self.fail_auth.store(fail, Ordering::Relaxed);
    }

    /// Delay authentication of links opened from now on.
    pub fn set_auth_latency(&self, latency: Duration) {
        store_latency(&self.auth_latency_ms, latency);
    }
}

#[async_trait]
impl DeviceConnector for MockConnector {
    async fn open(
        &self,
        target: &ConnectTarget,
        credentials: Option<&CloudCredentials>,
    ) -> Result<Arc<dyn DeviceLink>> {
        if self.fail_open.load(Ordering::Relaxed) {
            return Err(Error::NotFound(format!("{} out of range", target.mac())));
        }
        *self.last_credentials.write().await = credentials.cloned();

        let link = Arc::new(MockLink::for_target(target));
        link.set_fail_auth(self.fail_auth.load(Ordering::Relaxed));
        link.set_auth_latency(Duration::from_millis(
            self.auth_latency_ms.load(Ordering::Relaxed),
        ));
        self.links
            .write()
            .await
            .insert(target.mac(), Arc::clone(&link));
        self.open_count.fetch_add(1, Ordering::Relaxed);
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon() -> Beacon {
        Beacon::new(
            ESTIMOTE_PROXIMITY_UUID,
            7,
            8,
            MacAddress::new([1, 2, 3, 4, 5, 6]),
            -60,
            -59,
        )
    }

    #[tokio::test]
    async fn test_scanner_requires_handshake_before_start() {
        let scanner = MockScanner::new();
        assert!(scanner.start_discovery().await.is_err());
        scanner.connect().await.unwrap();
        scanner.start_discovery().await.unwrap();
        assert!(scanner.is_discovering());
        scanner.disconnect().await.unwrap();
        assert!(!scanner.is_discovering());
        assert_eq!(scanner.connect_count(), 1);
        assert_eq!(scanner.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_scanner_injects_events() {
        let scanner = MockScanner::new();
        let mut rx = scanner.subscribe();
        let region = Region::any("all");
        scanner.range(&region, vec![beacon()]);
        scanner.error(133);

        match rx.recv().await.unwrap() {
            ScannerEvent::Ranged { beacons, .. } => assert_eq!(beacons.len(), 1),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap(), ScannerEvent::Error(133));
    }

    #[tokio::test]
    async fn test_link_counts_reads_and_writes() {
        let link = MockLink::for_target(&ConnectTarget::Beacon(beacon()));
        assert_eq!(link.read_major().await.unwrap(), 7);
        link.write_major(9).await.unwrap();
        assert_eq!(link.major(), 9);
        assert_eq!(link.read_count(), 1);
        assert_eq!(link.write_count(), 1);

        link.close().await.unwrap();
        assert!(matches!(link.read_minor().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_connector_tracks_links_and_credentials() {
        let connector = MockConnector::new();
        let credentials = CloudCredentials::new("app", "secret");
        let target = ConnectTarget::Beacon(beacon());
        let link = connector.open(&target, Some(&credentials)).await.unwrap();
        let info = link.authenticate().await.unwrap();
        assert_eq!(info.major, 7);
        assert_eq!(connector.open_count(), 1);
        assert_eq!(connector.last_credentials().await, Some(credentials));
        assert!(connector.link(&target.mac()).await.is_some());
    }

    #[tokio::test]
    async fn test_radio_and_prompt() {
        let radio = MockRadio::new(false);
        assert!(!radio.is_powered().await.unwrap());
        radio.set_powered(true);
        assert!(radio.is_powered().await.unwrap());

        let prompt = MockPrompt::new();
        prompt.request_enable().await.unwrap();
        assert_eq!(prompt.request_count(), 1);
    }
}
