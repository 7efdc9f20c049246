//! `btleplug` backend for the scanner and radio seams.
//!
//! [`BtleScanner`] runs one passive BLE scan while it is bound and turns the
//! advertisements it sees into [`ScannerEvent`]s:
//!
//! - iBeacon frames are collected per ranging window and emitted for every
//!   ranged region when the window closes
//! - a monitored region is entered on the first matching beacon and exited
//!   after it has been silent for the exit timeout
//! - nearable frames and connectivity packets are reported once per window
//!   while their discovery is enabled
//!
//! Management connections need vendor authentication and are not provided
//! here; hosts supply their own [`DeviceConnector`](crate::traits::DeviceConnector).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use beacon_types::uuid::{APPLE_COMPANY_ID, ESTIMOTE_COMPANY_ID, ESTIMOTE_SERVICE};
use beacon_types::{Beacon, ConfigurableDevice, MacAddress, Nearable, Region};

use crate::advertisement::{parse_connectivity, parse_ibeacon, parse_nearable};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::ScannerEvent;
use crate::traits::{BeaconScanner, BluetoothRadio};

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound("no Bluetooth adapter".to_string()))
}

/// Radio power state read from a `btleplug` adapter.
pub struct BtleRadio {
    adapter: Adapter,
}

impl fmt::Debug for BtleRadio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtleRadio").finish_non_exhaustive()
    }
}

impl BtleRadio {
    /// Use the first available adapter.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_adapter(get_adapter().await?))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl BluetoothRadio for BtleRadio {
    async fn is_powered(&self) -> Result<bool> {
        let state = self.adapter.adapter_state().await?;
        debug!(?state, "adapter state");
        Ok(state == CentralState::PoweredOn)
    }
}

#[derive(Debug)]
struct MonitoredRegion {
    region: Region,
    last_seen: Option<Instant>,
    inside: bool,
}

/// What the scanner looks for and what it saw in the current window.
#[derive(Debug, Default)]
struct ScanWindow {
    ranging: Vec<Region>,
    monitoring: HashMap<String, MonitoredRegion>,
    discovering: bool,
    discovering_nearables: bool,
    beacons: HashMap<MacAddress, Beacon>,
    devices: HashMap<MacAddress, ConfigurableDevice>,
    nearables: HashMap<String, Nearable>,
}

impl ScanWindow {
    /// Record a beacon. Returns the regions it just entered.
    fn observe_beacon(&mut self, beacon: Beacon, now: Instant) -> Vec<ScannerEvent> {
        let mut entered = Vec::new();
        for monitored in self.monitoring.values_mut() {
            if !monitored.region.matches(&beacon) {
                continue;
            }
            monitored.last_seen = Some(now);
            if !monitored.inside {
                monitored.inside = true;
                entered.push(ScannerEvent::Entered(monitored.region.clone()));
            }
        }
        if !self.ranging.is_empty() {
            self.beacons.insert(beacon.mac, beacon);
        }
        entered
    }

    fn observe_device(&mut self, device: ConfigurableDevice) {
        if self.discovering {
            self.devices.insert(device.mac, device);
        }
    }

    fn observe_nearable(&mut self, nearable: Nearable) {
        if self.discovering_nearables {
            self.nearables.insert(nearable.identifier.clone(), nearable);
        }
    }

    /// Close the window: emit ranging batches, discovery results and exits.
    fn flush(&mut self, now: Instant, exit_timeout: Duration) -> Vec<ScannerEvent> {
        let mut events = Vec::new();

        let mut beacons: Vec<Beacon> = self.beacons.drain().map(|(_, b)| b).collect();
        beacons.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        for region in &self.ranging {
            let matching = beacons
                .iter()
                .filter(|b| region.matches(b))
                .cloned()
                .collect();
            events.push(ScannerEvent::Ranged {
                region: region.clone(),
                beacons: matching,
            });
        }

        if self.discovering {
            let devices = self.devices.drain().map(|(_, d)| d).collect();
            events.push(ScannerEvent::Discovered(devices));
        }
        if self.discovering_nearables {
            let nearables = self.nearables.drain().map(|(_, n)| n).collect();
            events.push(ScannerEvent::Nearables(nearables));
        }

        for monitored in self.monitoring.values_mut() {
            let silent = monitored
                .last_seen
                .is_none_or(|seen| now.saturating_duration_since(seen) >= exit_timeout);
            if monitored.inside && silent {
                monitored.inside = false;
                events.push(ScannerEvent::Exited(monitored.region.clone()));
            }
        }
        events
    }
}

struct ScanTask {
    adapter: Adapter,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// [`BeaconScanner`] over a `btleplug` adapter.
///
/// # Example
///
/// ```no_run
/// use beacon_core::{BeaconScanner, BtleScanner, EngineConfig};
/// use beacon_types::Region;
///
/// #[tokio::main]
/// async fn main() -> beacon_core::Result<()> {
///     let scanner = BtleScanner::new(&EngineConfig::default());
///     let mut events = scanner.subscribe();
///     scanner.connect().await?;
///     scanner.start_ranging(&Region::any("everything")).await?;
///     println!("{:?}", events.recv().await);
///     scanner.disconnect().await
/// }
/// ```
pub struct BtleScanner {
    sender: broadcast::Sender<ScannerEvent>,
    window: Arc<Mutex<ScanWindow>>,
    task: Mutex<Option<ScanTask>>,
    ranging_period: Duration,
    exit_timeout: Duration,
}

impl fmt::Debug for BtleScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtleScanner")
            .field("ranging_period", &self.ranging_period)
            .field("exit_timeout", &self.exit_timeout)
            .finish_non_exhaustive()
    }
}

impl BtleScanner {
    /// Create an unbound scanner.
    pub fn new(config: &EngineConfig) -> Self {
        let (sender, _) = broadcast::channel(config.event_capacity);
        Self {
            sender,
            window: Arc::new(Mutex::new(ScanWindow::default())),
            task: Mutex::new(None),
            ranging_period: config.ranging_period(),
            exit_timeout: config.monitor_exit_timeout(),
        }
    }

    async fn ensure_bound(&self) -> Result<()> {
        if self.task.lock().await.is_none() {
            return Err(Error::Scanner { code: -1 });
        }
        Ok(())
    }
}

#[async_trait]
impl BeaconScanner for BtleScanner {
    async fn connect(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let adapter = get_adapter().await?;
        if adapter.adapter_state().await? != CentralState::PoweredOn {
            return Err(Error::RadioOff);
        }
        let events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;
        info!("BLE scan started");

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scan_loop(
            adapter.clone(),
            events,
            Arc::clone(&self.window),
            self.sender.clone(),
            self.ranging_period,
            self.exit_timeout,
            cancel.clone(),
        ));
        *task = Some(ScanTask {
            adapter,
            cancel,
            handle,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "scan loop ended abnormally");
        }
        *self.window.lock().await = ScanWindow::default();
        task.adapter.stop_scan().await?;
        info!("BLE scan stopped");
        Ok(())
    }

    async fn start_ranging(&self, region: &Region) -> Result<()> {
        self.ensure_bound().await?;
        let mut window = self.window.lock().await;
        window.ranging.retain(|r| r.key() != region.key());
        window.ranging.push(region.clone());
        Ok(())
    }

    async fn stop_ranging(&self, region: &Region) -> Result<()> {
        self.window
            .lock()
            .await
            .ranging
            .retain(|r| r.key() != region.key());
        Ok(())
    }

    async fn start_monitoring(&self, region: &Region) -> Result<()> {
        self.ensure_bound().await?;
        self.window.lock().await.monitoring.insert(
            region.identifier.clone(),
            MonitoredRegion {
                region: region.clone(),
                last_seen: None,
                inside: false,
            },
        );
        Ok(())
    }

    async fn stop_monitoring(&self, identifier: &str) -> Result<()> {
        self.window.lock().await.monitoring.remove(identifier);
        Ok(())
    }

    async fn start_discovery(&self) -> Result<()> {
        self.ensure_bound().await?;
        self.window.lock().await.discovering = true;
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<()> {
        let mut window = self.window.lock().await;
        window.discovering = false;
        window.devices.clear();
        Ok(())
    }

    async fn start_nearable_discovery(&self) -> Result<()> {
        self.ensure_bound().await?;
        self.window.lock().await.discovering_nearables = true;
        Ok(())
    }

    async fn stop_nearable_discovery(&self) -> Result<()> {
        let mut window = self.window.lock().await;
        window.discovering_nearables = false;
        window.nearables.clear();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ScannerEvent> {
        self.sender.subscribe()
    }
}

async fn scan_loop(
    adapter: Adapter,
    mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    window: Arc<Mutex<ScanWindow>>,
    sender: broadcast::Sender<ScannerEvent>,
    ranging_period: Duration,
    exit_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(ranging_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("scan loop cancelled");
                break;
            }
            _ = ticker.tick() => {
                let flushed = window.lock().await.flush(Instant::now(), exit_timeout);
                for event in flushed {
                    // Ignore error if no receivers
                    let _ = sender.send(event);
                }
            }
            event = events.next() => {
                let Some(event) = event else {
                    warn!("adapter event stream ended");
                    let _ = sender.send(ScannerEvent::Error(-1));
                    break;
                };
                if let Err(e) = handle_event(&adapter, &window, &sender, event).await {
                    trace!(error = %e, "ignoring advertisement");
                }
            }
        }
    }
}

async fn peripheral_info(adapter: &Adapter, id: &PeripheralId) -> Result<(MacAddress, i16)> {
    let peripheral = adapter.peripheral(id).await?;
    let properties = peripheral
        .properties()
        .await?
        .ok_or_else(|| Error::NotFound(format!("no properties for {id:?}")))?;
    let rssi = properties.rssi.unwrap_or(0);
    Ok((MacAddress::new(properties.address.into_inner()), rssi))
}

async fn handle_event(
    adapter: &Adapter,
    window: &Mutex<ScanWindow>,
    sender: &broadcast::Sender<ScannerEvent>,
    event: CentralEvent,
) -> Result<()> {
    match event {
        CentralEvent::ManufacturerDataAdvertisement {
            id,
            manufacturer_data,
        } => {
            if let Some(data) = manufacturer_data.get(&APPLE_COMPANY_ID) {
                let (mac, rssi) = peripheral_info(adapter, &id).await?;
                let beacon = parse_ibeacon(data, mac, rssi)?;
                let entered = window.lock().await.observe_beacon(beacon, Instant::now());
                for event in entered {
                    let _ = sender.send(event);
                }
            }
            if let Some(data) = manufacturer_data.get(&ESTIMOTE_COMPANY_ID) {
                let nearable = parse_nearable(data)?;
                window.lock().await.observe_nearable(nearable);
            }
        }
        CentralEvent::ServiceDataAdvertisement { id, service_data } => {
            if let Some(data) = service_data.get(&ESTIMOTE_SERVICE) {
                let (mac, rssi) = peripheral_info(adapter, &id).await?;
                let device = parse_connectivity(data, mac, rssi, OffsetDateTime::now_utc())?;
                window.lock().await.observe_device(device);
            }
        }
        _ => {}
    }
    Ok(())
}
