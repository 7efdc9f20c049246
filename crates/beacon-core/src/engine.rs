//! The engine context object.
//!
//! [`BeaconEngine`] wires the adapter gate, scan session, subscription
//! registry, observation cache and connection manager together and runs the
//! event loop that demultiplexes scanner callbacks onto subscriptions.
//!
//! There is no process-global state: the host creates one engine, drives it
//! through [`CommandDispatcher`](crate::dispatcher::CommandDispatcher) and
//! calls [`BeaconEngine::teardown`] when it goes away.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use beacon_core::{Backend, BeaconEngine, EngineConfig};
//! use beacon_core::mock::{MockConnector, MockPrompt, MockRadio, MockScanner};
//!
//! #[tokio::main]
//! async fn main() -> beacon_core::Result<()> {
//!     let backend = Backend {
//!         scanner: Arc::new(MockScanner::new()),
//!         radio: Arc::new(MockRadio::new(true)),
//!         prompt: Arc::new(MockPrompt::new()),
//!         connector: Arc::new(MockConnector::new()),
//!     };
//!     let engine = BeaconEngine::start(EngineConfig::default(), backend)?;
//!     assert!(engine.bluetooth_state().await?);
//!     engine.teardown().await;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use beacon_types::{DeviceDescriptor, DeviceInfo, Region};

use crate::adapter::AdapterGate;
use crate::cache::ObservationCache;
use crate::codec::RegionState;
use crate::config::EngineConfig;
use crate::connection::{ConnectionManager, ConnectionState, WriteOutcome};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventDispatcher, EventReceiver, ScannerEvent};
use crate::registry::{Registration, Subscription, SubscriptionKey, SubscriptionRegistry};
use crate::responder::ResponderHandle;
use crate::scan::{Attachment, ScanSession, SessionPhase};
use crate::traits::{
    BeaconScanner, BluetoothRadio, CloudCredentials, ConnectTarget, DeviceConnector, EnablePrompt,
};

/// The platform collaborators an engine drives.
#[derive(Clone)]
pub struct Backend {
    /// The shared BLE scanner.
    pub scanner: Arc<dyn BeaconScanner>,
    /// Radio power state.
    pub radio: Arc<dyn BluetoothRadio>,
    /// The host's enable dialog.
    pub prompt: Arc<dyn EnablePrompt>,
    /// Opens management links.
    pub connector: Arc<dyn DeviceConnector>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

/// Beacon observation and connection engine.
pub struct BeaconEngine {
    config: EngineConfig,
    cache: Arc<ObservationCache>,
    registry: Arc<SubscriptionRegistry>,
    session: ScanSession,
    adapter: AdapterGate,
    connection: ConnectionManager,
    events: EventDispatcher,
    credentials: Mutex<Option<CloudCredentials>>,
    cancel: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for BeaconEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeaconEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BeaconEngine {
    /// Validate the configuration, build the engine and spawn its event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: EngineConfig, backend: Backend) -> Result<Arc<Self>> {
        config.validate()?;

        let events = EventDispatcher::new(config.event_capacity);
        let cache = Arc::new(ObservationCache::new());
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&cache)));
        let scanner_events = backend.scanner.subscribe();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_event_loop(
            scanner_events,
            Arc::clone(&registry),
            events.clone(),
            cancel.clone(),
        ));

        info!(?config, "beacon engine started");
        Ok(Arc::new(Self {
            session: ScanSession::new(backend.scanner, Arc::clone(&registry), events.clone()),
            adapter: AdapterGate::new(backend.radio, backend.prompt),
            connection: ConnectionManager::new(
                backend.connector,
                events.clone(),
                config.connect_timeout(),
            ),
            config,
            cache,
            registry,
            events,
            credentials: Mutex::new(None),
            cancel,
            event_loop: Mutex::new(Some(handle)),
        }))
    }

    /// The configuration the engine was started with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to engine events.
    pub fn events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// The observation cache.
    pub fn cache(&self) -> &ObservationCache {
        &self.cache
    }

    /// Number of live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.registry.len().await
    }

    /// Whether the shared scanner is bound or binding.
    pub async fn is_scanning(&self) -> bool {
        self.session.is_running().await
    }

    /// Scan session phase.
    pub async fn session_phase(&self) -> SessionPhase {
        self.session.phase().await
    }

    /// Connection manager state.
    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    // --- Ranging and monitoring ---

    /// Stream ranging results for a region to `sink`.
    ///
    /// A second subscriber for an already ranged region is closed with a
    /// no-result; the first one keeps the stream.
    pub async fn start_ranging(&self, region: Region, sink: ResponderHandle) -> Result<()> {
        let key = SubscriptionKey::Ranging(region.key());
        let registration = self
            .registry
            .subscribe(Subscription {
                key,
                region: Some(region.clone()),
                sink: sink.clone(),
            })
            .await?;
        if matches!(registration, Registration::Kept) {
            sink.no_result();
            return Ok(());
        }
        self.session.attach(Attachment::Ranging(region)).await
    }

    /// Stop ranging a region. Closes the ranging stream with a no-result.
    pub async fn stop_ranging(&self, region: &Region) -> Result<()> {
        let key = SubscriptionKey::Ranging(region.key());
        self.registry.unsubscribe(&key).await?;
        self.session.detach(&key).await;
        Ok(())
    }

    /// Stream enter/exit events for a region to `sink`.
    ///
    /// Re-registering a monitored region moves the stream to the new sink.
    pub async fn start_monitoring(&self, region: Region, sink: ResponderHandle) -> Result<()> {
        let key = SubscriptionKey::Monitoring(region.key());
        let registration = self
            .registry
            .subscribe(Subscription {
                key,
                region: Some(region.clone()),
                sink,
            })
            .await?;
        if let Registration::Replaced(previous) = registration {
            previous.sink.no_result();
        }
        self.session.attach(Attachment::Monitoring(region)).await
    }

    /// Stop monitoring a region. Closes the monitoring stream with a no-result.
    pub async fn stop_monitoring(&self, region: &Region) -> Result<()> {
        let key = SubscriptionKey::Monitoring(region.key());
        self.registry.unsubscribe(&key).await?;
        self.session.detach(&key).await;
        Ok(())
    }

    // --- Discovery ---

    /// Stream discovered configurable devices to `sink`.
    pub async fn start_discovery(&self, sink: ResponderHandle) -> Result<()> {
        self.subscribe_keyword(SubscriptionKey::Discovery, Attachment::Discovery, sink)
            .await
    }

    /// Stop device discovery.
    pub async fn stop_discovery(&self) -> Result<()> {
        self.unsubscribe_keyword(SubscriptionKey::Discovery).await
    }

    /// Stream nearables to `sink`.
    pub async fn start_nearables(&self, sink: ResponderHandle) -> Result<()> {
        self.subscribe_keyword(SubscriptionKey::Nearable, Attachment::Nearable, sink)
            .await
    }

    /// Stop nearable discovery.
    pub async fn stop_nearables(&self) -> Result<()> {
        self.unsubscribe_keyword(SubscriptionKey::Nearable).await
    }

    async fn subscribe_keyword(
        &self,
        key: SubscriptionKey,
        attachment: Attachment,
        sink: ResponderHandle,
    ) -> Result<()> {
        self.registry
            .subscribe(Subscription {
                key,
                region: None,
                sink,
            })
            .await?;
        self.session.attach(attachment).await
    }

    async fn unsubscribe_keyword(&self, key: SubscriptionKey) -> Result<()> {
        self.registry.unsubscribe(&key).await?;
        self.session.detach(&key).await;
        Ok(())
    }

    // --- Cloud credentials ---

    /// Store the cloud credentials. They can be set once per engine.
    pub async fn set_credentials(&self, credentials: CloudCredentials) -> Result<()> {
        let mut slot = self.credentials.lock().await;
        if slot.is_some() {
            return Err(Error::AlreadyAuthenticated);
        }
        info!(app_id = %credentials.app_id, "cloud credentials set");
        *slot = Some(credentials);
        Ok(())
    }

    /// The stored cloud credentials.
    pub async fn credentials(&self) -> Option<CloudCredentials> {
        self.credentials.lock().await.clone()
    }

    // --- Connections ---

    /// Connect to a ranged beacon.
    pub async fn connect_to_beacon(&self, descriptor: &DeviceDescriptor) -> Result<DeviceInfo> {
        let beacon = self
            .cache
            .find_from_descriptor(descriptor)
            .await
            .ok_or_else(|| Error::NotFound(format!("no ranged beacon matches {descriptor}")))?;
        self.connect(ConnectTarget::Beacon(beacon)).await
    }

    /// Connect to a discovered configurable device.
    pub async fn connect_to_device(&self, descriptor: &DeviceDescriptor) -> Result<DeviceInfo> {
        let device = self
            .cache
            .find_device(descriptor)
            .await
            .ok_or_else(|| Error::NotFound(format!("no discovered device matches {descriptor}")))?;
        self.connect(ConnectTarget::Device(device)).await
    }

    async fn connect(&self, target: ConnectTarget) -> Result<DeviceInfo> {
        let credentials = self.credentials().await;
        self.connection.connect(&target, credentials.as_ref()).await
    }

    /// Disconnect the connected device.
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Write the proximity UUID of the connected device.
    pub async fn write_proximity_uuid(&self, uuid: Uuid) -> Result<WriteOutcome> {
        self.connection.write_proximity_uuid(uuid).await
    }

    /// Write the major of the connected device.
    pub async fn write_major(&self, major: u16) -> Result<WriteOutcome> {
        self.connection.write_major(major).await
    }

    /// Write the minor of the connected device.
    pub async fn write_minor(&self, minor: u16) -> Result<WriteOutcome> {
        self.connection.write_minor(minor).await
    }

    // --- Adapter ---

    /// Whether the radio is on, prompting the user to turn it on if not.
    pub async fn bluetooth_state(&self) -> Result<bool> {
        self.adapter.ensure_enabled().await
    }

    /// Like [`bluetooth_state`](Self::bluetooth_state), joining an outstanding
    /// prompt instead of failing with [`Error::BusyPrompt`].
    pub async fn wait_bluetooth_enabled(&self) -> Result<bool> {
        self.adapter.wait_enabled().await
    }

    /// Deliver the user's answer to the enable prompt.
    pub async fn on_activity_result(&self, accepted: bool) -> bool {
        self.adapter.on_activity_result(accepted).await
    }

    // --- Lifecycle ---

    /// Navigation reset.
    ///
    /// Clears every subscription without notifying its sink, releases the
    /// scanner, closes any device link and forgets cached observations.
    pub async fn reset(&self) {
        let cleared = self.registry.clear().await;
        self.session.reset().await;
        self.connection.reset().await;
        self.cache.clear().await;
        info!(subscriptions = cleared.len(), "engine reset");
    }

    /// Reset, abandon the enable prompt and stop the event loop.
    pub async fn teardown(&self) {
        self.reset().await;
        self.adapter.abandon().await;
        self.cancel.cancel();
        if let Some(handle) = self.event_loop.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "event loop ended abnormally");
            }
        }
        info!("engine torn down");
    }
}

async fn run_event_loop(
    mut scanner_events: broadcast::Receiver<ScannerEvent>,
    registry: Arc<SubscriptionRegistry>,
    events: EventDispatcher,
    cancel: CancellationToken,
) {
    debug!("event loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("event loop cancelled");
                break;
            }
            received = scanner_events.recv() => match received {
                Ok(event) => route(&registry, &events, event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event loop lagged behind scanner callbacks");
                }
                Err(RecvError::Closed) => {
                    info!("scanner callback channel closed");
                    break;
                }
            }
        }
    }
}

async fn route(registry: &SubscriptionRegistry, events: &EventDispatcher, event: ScannerEvent) {
    match event {
        ScannerEvent::Ranged { region, beacons } => registry.on_ranged(&region, beacons).await,
        ScannerEvent::Entered(region) => {
            registry.on_region_state(&region, RegionState::Inside).await;
        }
        ScannerEvent::Exited(region) => {
            registry.on_region_state(&region, RegionState::Outside).await;
        }
        ScannerEvent::Discovered(devices) => registry.on_discovered(devices).await,
        ScannerEvent::Nearables(nearables) => registry.on_nearables(&nearables).await,
        ScannerEvent::Error(code) => {
            warn!(code, "scanner error");
            events.send(EngineEvent::ScannerError { code });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{MockConnector, MockPrompt, MockRadio, MockScanner};
    use crate::responder::{PluginResult, Status, responder_channel};
    use beacon_types::uuid::ESTIMOTE_PROXIMITY_UUID;
    use beacon_types::{Beacon, MacAddress};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        engine: Arc<BeaconEngine>,
        scanner: Arc<MockScanner>,
        connector: Arc<MockConnector>,
    }

    fn harness() -> Harness {
        let scanner = Arc::new(MockScanner::new());
        let connector = Arc::new(MockConnector::new());
        let backend = Backend {
            scanner: scanner.clone(),
            radio: Arc::new(MockRadio::new(true)),
            prompt: Arc::new(MockPrompt::new()),
            connector: connector.clone(),
        };
        let engine = BeaconEngine::start(EngineConfig::default(), backend).unwrap();
        Harness {
            engine,
            scanner,
            connector,
        }
    }

    fn region() -> Region {
        Region::with_uuid("office", ESTIMOTE_PROXIMITY_UUID)
    }

    fn beacon(last: u8) -> Beacon {
        Beacon::new(
            ESTIMOTE_PROXIMITY_UUID,
            10,
            u16::from(last),
            MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last]),
            -65,
            -59,
        )
    }

    async fn next(rx: &mut UnboundedReceiver<PluginResult>) -> PluginResult {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for result")
            .expect("responder channel closed")
    }

    #[tokio::test]
    async fn test_ranging_batch_reaches_sink_and_cache() {
        let h = harness();
        let (sink, mut rx) = responder_channel();
        h.engine.start_ranging(region(), sink).await.unwrap();
        assert!(h.engine.is_scanning().await);

        h.scanner.range(&region(), vec![beacon(1), beacon(2)]);
        let result = next(&mut rx).await;
        assert!(result.keep_callback);
        let payload = result.payload.unwrap();
        assert_eq!(payload["beacons"].as_array().unwrap().len(), 2);
        assert_eq!(payload["region"]["identifier"], "office");
        assert_eq!(h.engine.cache().beacons().await.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_ranging_closes_second_sink() {
        let h = harness();
        let (first, _rx1) = responder_channel();
        let (second, mut rx2) = responder_channel();
        h.engine.start_ranging(region(), first).await.unwrap();
        h.engine.start_ranging(region(), second).await.unwrap();

        assert_eq!(next(&mut rx2).await.status, Status::NoResult);
        assert_eq!(h.engine.subscription_count().await, 1);
        assert_eq!(h.scanner.ranging_regions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_last_subscription_releases_scanner() {
        let h = harness();
        let (sink, mut rx) = responder_channel();
        h.engine.start_ranging(region(), sink).await.unwrap();
        h.engine.stop_ranging(&region()).await.unwrap();

        assert_eq!(next(&mut rx).await.status, Status::NoResult);
        assert!(!h.engine.is_scanning().await);
        assert_eq!(h.scanner.disconnect_count(), 1);

        let err = h.engine.stop_ranging(&region()).await.unwrap_err();
        assert_eq!(err.code(), "NotSubscribed");
    }

    #[tokio::test]
    async fn test_credentials_set_once() {
        let h = harness();
        h.engine
            .set_credentials(CloudCredentials::new("app", "token"))
            .await
            .unwrap();
        let err = h
            .engine
            .set_credentials(CloudCredentials::new("other", "token"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyAuthenticated));
        assert_eq!(h.engine.credentials().await.unwrap().app_id, "app");
    }

    #[tokio::test]
    async fn test_connect_uses_cached_beacon_and_credentials() {
        let h = harness();
        let descriptor = DeviceDescriptor::ByMac(beacon(7).mac);
        let err = h.engine.connect_to_beacon(&descriptor).await.unwrap_err();
        assert_eq!(err.code(), "NotFound");

        h.engine
            .set_credentials(CloudCredentials::new("app", "token"))
            .await
            .unwrap();
        let (sink, mut rx) = responder_channel();
        h.engine.start_ranging(region(), sink).await.unwrap();
        h.scanner.range(&region(), vec![beacon(7)]);
        next(&mut rx).await;

        let info = h.engine.connect_to_beacon(&descriptor).await.unwrap();
        assert_eq!(info.minor, 7);
        assert_eq!(
            h.connector.last_credentials().await.unwrap().app_id,
            "app"
        );
    }

    #[tokio::test]
    async fn test_scanner_error_is_broadcast_not_fatal() {
        let h = harness();
        let mut events = h.engine.events();
        let (sink, mut rx) = responder_channel();
        h.engine.start_discovery(sink).await.unwrap();

        h.scanner.error(133);
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            if event == (EngineEvent::ScannerError { code: 133 }) {
                break;
            }
        }
        assert_eq!(h.engine.subscription_count().await, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reset_silences_sinks_and_releases_everything() {
        let h = harness();
        let (sink, mut rx) = responder_channel();
        h.engine.start_monitoring(region(), sink).await.unwrap();
        h.engine.reset().await;

        assert_eq!(h.engine.subscription_count().await, 0);
        assert!(!h.engine.is_scanning().await);
        h.scanner.enter(&region());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_teardown_stops_event_loop() {
        let h = harness();
        h.engine.teardown().await;
        assert!(h.engine.event_loop.lock().await.is_none());
    }
}
