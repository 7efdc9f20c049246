//! Beacon observation and connection engine.
//!
//! This crate bridges a host command runtime (an action name, a JSON argument
//! array and a callback) to a BLE stack. It owns the single shared scanner,
//! fans scanner callbacks out to long-lived streaming callbacks, and manages
//! one vendor-authenticated connection at a time for reading and writing a
//! beacon's advertised identity.
//!
//! # Features
//!
//! - **Ranging**: periodic batches of beacons seen in a region
//! - **Monitoring**: enter/exit events for a region
//! - **Discovery**: configurable devices and nearable stickers
//! - **Connections**: connect, authenticate, read-modify-write of
//!   proximity UUID, major and minor
//! - **Adapter gate**: radio power check with a one-shot enable prompt
//! - **Backends**: `btleplug` scanner and radio, plus mocks for tests
//!
//! # Components
//!
//! | Component | Type |
//! |-----------|------|
//! | Command dispatcher | [`CommandDispatcher`] |
//! | Engine context | [`BeaconEngine`] |
//! | Adapter gate | [`AdapterGate`] |
//! | Scan session | [`ScanSession`] |
//! | Subscription registry | [`SubscriptionRegistry`] |
//! | Observation cache | [`ObservationCache`] |
//! | Connection manager | [`ConnectionManager`] |
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use beacon_core::mock::{MockConnector, MockPrompt, MockRadio, MockScanner};
//! use beacon_core::{Backend, BeaconEngine, CommandDispatcher, EngineConfig, responder_channel};
//! use beacon_types::{Beacon, Region, uuid::ESTIMOTE_PROXIMITY_UUID};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> beacon_core::Result<()> {
//!     let scanner = Arc::new(MockScanner::new());
//!     let engine = BeaconEngine::start(
//!         EngineConfig::default(),
//!         Backend {
//!             scanner: scanner.clone(),
//!             radio: Arc::new(MockRadio::new(true)),
//!             prompt: Arc::new(MockPrompt::new()),
//!             connector: Arc::new(MockConnector::new()),
//!         },
//!     )?;
//!     let dispatcher = CommandDispatcher::new(engine);
//!
//!     let (responder, mut results) = responder_channel();
//!     let region = json!({"identifier": "office", "uuid": "B9407F30-F5F8-466E-AFF9-25556B57FE6D"});
//!     dispatcher
//!         .dispatch("beacons_startRangingBeaconsInRegion", &[region], responder)
//!         .await;
//!
//!     let office = Region::with_uuid("office", ESTIMOTE_PROXIMITY_UUID);
//!     let beacon = Beacon::new(ESTIMOTE_PROXIMITY_UUID, 1, 2, Default::default(), -70, -59);
//!     scanner.range(&office, vec![beacon]);
//!
//!     let batch = results.recv().await.unwrap();
//!     assert_eq!(batch.payload.unwrap()["beacons"][0]["major"], 1);
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod advertisement;
pub mod btle;
pub mod cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod mock;
pub mod registry;
pub mod responder;
pub mod scan;
pub mod traits;

// Core exports
pub use adapter::AdapterGate;
pub use cache::ObservationCache;
pub use config::EngineConfig;
pub use connection::{ConnectionManager, ConnectionState, WriteOutcome};
pub use dispatcher::{Action, CommandDispatcher};
pub use engine::{Backend, BeaconEngine};
pub use error::{Error, Result};
pub use events::{
    DisconnectReason, EngineEvent, EventDispatcher, EventReceiver, EventSender, ScannerEvent,
};
pub use registry::{
    Registration, Subscription, SubscriptionKey, SubscriptionKind, SubscriptionRegistry,
};
pub use responder::{
    ChannelResponder, PluginResult, Responder, ResponderHandle, Status, responder_channel,
};
pub use scan::{Attachment, ScanSession, SessionPhase};
pub use traits::{
    BeaconScanner, BluetoothRadio, CloudCredentials, ConnectTarget, DeviceConnector, DeviceLink,
    EnablePrompt,
};

// Backends
pub use btle::{BtleRadio, BtleScanner};
pub use mock::{MockConnector, MockLink, MockPrompt, MockRadio, MockScanner};

// Re-export from beacon-types
pub use beacon_types::{
    Beacon, ConfigurableDevice, DeviceDescriptor, DeviceInfo, MacAddress, Nearable, Proximity,
    Region, RegionKey,
};
