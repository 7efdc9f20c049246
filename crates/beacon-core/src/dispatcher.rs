//! Host command surface.
//!
//! The host calls [`CommandDispatcher::execute`] with an action name, a JSON
//! argument array and a responder. Unknown actions return `false` so the host
//! can route them elsewhere. Arguments are decoded and validated before any
//! engine state changes; a validation failure answers the responder with an
//! error and leaves the engine untouched.
//!
//! | Action | Arguments | Response |
//! |--------|-----------|----------|
//! | `beacons_startRangingBeaconsInRegion` | `[region]` | stream of `{region, beacons}` |
//! | `beacons_stopRangingBeaconsInRegion` | `[region]` | one-shot |
//! | `beacons_startMonitoringForRegion` | `[region]` | stream of `{..region, state}` |
//! | `beacons_stopMonitoringForRegion` | `[region]` | one-shot |
//! | `beacons_startDiscoveringDevices` | `[]` | stream of `{devices}` |
//! | `beacons_stopDiscoveringDevices` | `[]` | one-shot |
//! | `nearables_startRangingForType` | `[]` | stream of nearable arrays |
//! | `nearables_stopRangingForType` | `[]` | one-shot |
//! | `beacons_setupAppIDAndAppToken` | `[appId, appToken]` | one-shot |
//! | `beacons_connectToBeacon` | `[descriptor]` | one-shot device snapshot |
//! | `beacons_connectToDevice` | `[descriptor]` | one-shot device snapshot |
//! | `beacons_disconnectConnectedBeacon` | `[]` | one-shot |
//! | `beacons_disconnectFromDevice` | `[]` | one-shot |
//! | `beacons_writeConnectedProximityUUID` | `[uuid]` | one-shot |
//! | `beacons_writeConnectedMajor` | `[major]` | one-shot |
//! | `beacons_writeConnectedMinor` | `[minor]` | one-shot |
//! | `bluetooth_bluetoothState` | `[]` | one-shot `1` or `0` |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use beacon_types::{DeviceDescriptor, Region};
use beacon_types::uuid::parse_proximity_uuid;

use crate::codec::{self, arg, arg_str};
use crate::engine::BeaconEngine;
use crate::error::{Error, Result};
use crate::responder::ResponderHandle;
use crate::traits::CloudCredentials;

/// A recognised host action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    StartRanging,
    StopRanging,
    StartMonitoring,
    StopMonitoring,
    StartDiscovery,
    StopDiscovery,
    StartNearables,
    StopNearables,
    SetupCredentials,
    ConnectToBeacon,
    ConnectToDevice,
    DisconnectBeacon,
    DisconnectDevice,
    WriteProximityUuid,
    WriteMajor,
    WriteMinor,
    BluetoothState,
}

impl Action {
    /// Every action, in table order.
    pub const ALL: [Action; 17] = [
        Self::StartRanging,
        Self::StopRanging,
        Self::StartMonitoring,
        Self::StopMonitoring,
        Self::StartDiscovery,
        Self::StopDiscovery,
        Self::StartNearables,
        Self::StopNearables,
        Self::SetupCredentials,
        Self::ConnectToBeacon,
        Self::ConnectToDevice,
        Self::DisconnectBeacon,
        Self::DisconnectDevice,
        Self::WriteProximityUuid,
        Self::WriteMajor,
        Self::WriteMinor,
        Self::BluetoothState,
    ];

    /// The host-facing action name.
    pub fn name(self) -> &'static str {
        match self {
            Self::StartRanging => "beacons_startRangingBeaconsInRegion",
            Self::StopRanging => "beacons_stopRangingBeaconsInRegion",
            Self::StartMonitoring => "beacons_startMonitoringForRegion",
            Self::StopMonitoring => "beacons_stopMonitoringForRegion",
            Self::StartDiscovery => "beacons_startDiscoveringDevices",
            Self::StopDiscovery => "beacons_stopDiscoveringDevices",
            Self::StartNearables => "nearables_startRangingForType",
            Self::StopNearables => "nearables_stopRangingForType",
            Self::SetupCredentials => "beacons_setupAppIDAndAppToken",
            Self::ConnectToBeacon => "beacons_connectToBeacon",
            Self::ConnectToDevice => "beacons_connectToDevice",
            Self::DisconnectBeacon => "beacons_disconnectConnectedBeacon",
            Self::DisconnectDevice => "beacons_disconnectFromDevice",
            Self::WriteProximityUuid => "beacons_writeConnectedProximityUUID",
            Self::WriteMajor => "beacons_writeConnectedMajor",
            Self::WriteMinor => "beacons_writeConnectedMinor",
            Self::BluetoothState => "bluetooth_bluetoothState",
        }
    }

    /// Whether the action answers with a stream.
    pub fn is_streaming(self) -> bool {
        matches!(
            self,
            Self::StartRanging | Self::StartMonitoring | Self::StartDiscovery | Self::StartNearables
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| Error::invalid_argument(format!("unknown action: {s}")))
    }
}

/// What a handled command still owes the host.
enum Reply {
    /// The responder now belongs to a subscription.
    Streaming,
    /// One-shot success, optionally with a payload.
    Done(Option<Value>),
}

/// A validated command, ready to run against the engine.
enum Command {
    StartRanging(Region),
    StopRanging(Region),
    StartMonitoring(Region),
    StopMonitoring(Region),
    StartDiscovery,
    StopDiscovery,
    StartNearables,
    StopNearables,
    SetupCredentials(CloudCredentials),
    ConnectToBeacon(DeviceDescriptor),
    ConnectToDevice(DeviceDescriptor),
    Disconnect,
    WriteProximityUuid(Uuid),
    WriteMajor(u16),
    WriteMinor(u16),
    BluetoothState,
}

impl Command {
    fn parse(action: Action, args: &[Value]) -> Result<Self> {
        let command = match action {
            Action::StartRanging => Self::StartRanging(codec::parse_region(arg(args, 0)?)?),
            Action::StopRanging => Self::StopRanging(codec::parse_region(arg(args, 0)?)?),
            Action::StartMonitoring => Self::StartMonitoring(codec::parse_region(arg(args, 0)?)?),
            Action::StopMonitoring => Self::StopMonitoring(codec::parse_region(arg(args, 0)?)?),
            Action::StartDiscovery => Self::StartDiscovery,
            Action::StopDiscovery => Self::StopDiscovery,
            Action::StartNearables => Self::StartNearables,
            Action::StopNearables => Self::StopNearables,
            Action::SetupCredentials => Self::SetupCredentials(CloudCredentials::new(
                arg_str(args, 0)?,
                arg_str(args, 1)?,
            )),
            Action::ConnectToBeacon => Self::ConnectToBeacon(descriptor(args)?),
            Action::ConnectToDevice => Self::ConnectToDevice(descriptor(args)?),
            Action::DisconnectBeacon | Action::DisconnectDevice => Self::Disconnect,
            Action::WriteProximityUuid => {
                let raw = arg(args, 0)?
                    .as_str()
                    .ok_or_else(|| Error::InvalidUuid("proximity UUID must be a string".into()))?;
                Self::WriteProximityUuid(parse_proximity_uuid(raw)?)
            }
            Action::WriteMajor => Self::WriteMajor(codec::parse_identity_value(arg(args, 0)?, "major")?),
            Action::WriteMinor => Self::WriteMinor(codec::parse_identity_value(arg(args, 0)?, "minor")?),
            Action::BluetoothState => Self::BluetoothState,
        };
        Ok(command)
    }
}

fn descriptor(args: &[Value]) -> Result<DeviceDescriptor> {
    codec::parse_descriptor(arg(args, 0)?)?.ok_or_else(|| {
        Error::invalid_argument(
            "descriptor must carry a macAddress or a proximityUUID with major and minor",
        )
    })
}

/// Routes host actions onto a [`BeaconEngine`].
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    engine: Arc<BeaconEngine>,
}

impl CommandDispatcher {
    /// Create a dispatcher over an engine.
    pub fn new(engine: Arc<BeaconEngine>) -> Self {
        Self { engine }
    }

    /// The engine commands run against.
    pub fn engine(&self) -> &Arc<BeaconEngine> {
        &self.engine
    }

    /// Run an action on a background task.
    ///
    /// Returns `false` without touching the responder when the action is not
    /// recognised.
    pub fn execute(&self, action: &str, args: Vec<Value>, responder: ResponderHandle) -> bool {
        let Ok(action) = action.parse::<Action>() else {
            debug!(action, "unrecognised action");
            return false;
        };
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run(action, &args, responder).await });
        true
    }

    /// Run an action to completion on the current task.
    ///
    /// Returns `false` without touching the responder when the action is not
    /// recognised. Streaming actions return once the subscription is live.
    pub async fn dispatch(&self, action: &str, args: &[Value], responder: ResponderHandle) -> bool {
        let Ok(action) = action.parse::<Action>() else {
            debug!(action, "unrecognised action");
            return false;
        };
        self.run(action, args, responder).await;
        true
    }

    /// Host navigation reset.
    pub async fn on_reset(&self) {
        self.engine.reset().await;
    }

    /// Host teardown.
    pub async fn on_destroy(&self) {
        self.engine.teardown().await;
    }

    /// The user answered the enable-Bluetooth prompt.
    pub async fn on_activity_result(&self, accepted: bool) -> bool {
        self.engine.on_activity_result(accepted).await
    }

    async fn run(&self, action: Action, args: &[Value], responder: ResponderHandle) {
        debug!(%action, responder = responder.id(), "dispatching");
        let result = match Command::parse(action, args) {
            Ok(command) => self.apply(command, &responder).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(Reply::Streaming) => {}
            Ok(Reply::Done(None)) => {
                responder.success();
            }
            Ok(Reply::Done(Some(payload))) => {
                responder.emit(payload, false);
            }
            Err(Error::Cancelled) => {
                debug!(%action, "command cancelled by reset");
                responder.revoke();
            }
            Err(e) => {
                warn!(%action, code = e.code(), error = %e, "command failed");
                responder.fail(&e);
            }
        }
    }

    async fn apply(&self, command: Command, responder: &ResponderHandle) -> Result<Reply> {
        let engine = &self.engine;
        match command {
            Command::StartRanging(region) => {
                engine.start_ranging(region, responder.clone()).await?;
                Ok(Reply::Streaming)
            }
            Command::StopRanging(region) => {
                engine.stop_ranging(&region).await?;
                Ok(Reply::Done(None))
            }
            Command::StartMonitoring(region) => {
                engine.start_monitoring(region, responder.clone()).await?;
                Ok(Reply::Streaming)
            }
            Command::StopMonitoring(region) => {
                engine.stop_monitoring(&region).await?;
                Ok(Reply::Done(None))
            }
            Command::StartDiscovery => {
                engine.start_discovery(responder.clone()).await?;
                Ok(Reply::Streaming)
            }
            Command::StopDiscovery => {
                engine.stop_discovery().await?;
                Ok(Reply::Done(None))
            }
            Command::StartNearables => {
                engine.start_nearables(responder.clone()).await?;
                Ok(Reply::Streaming)
            }
            Command::StopNearables => {
                engine.stop_nearables().await?;
                Ok(Reply::Done(None))
            }
            Command::SetupCredentials(credentials) => {
                engine.set_credentials(credentials).await?;
                Ok(Reply::Done(None))
            }
            Command::ConnectToBeacon(descriptor) => {
                let info = engine.connect_to_beacon(&descriptor).await?;
                Ok(Reply::Done(Some(codec::encode_device_info(&info))))
            }
            Command::ConnectToDevice(descriptor) => {
                let info = engine.connect_to_device(&descriptor).await?;
                Ok(Reply::Done(Some(codec::encode_device_info(&info))))
            }
            Command::Disconnect => {
                engine.disconnect().await?;
                Ok(Reply::Done(None))
            }
            Command::WriteProximityUuid(uuid) => {
                engine.write_proximity_uuid(uuid).await?;
                Ok(Reply::Done(None))
            }
            Command::WriteMajor(major) => {
                engine.write_major(major).await?;
                Ok(Reply::Done(None))
            }
            Command::WriteMinor(minor) => {
                engine.write_minor(minor).await?;
                Ok(Reply::Done(None))
            }
            Command::BluetoothState => {
                let enabled = engine.bluetooth_state().await?;
                Ok(Reply::Done(Some(json!(u8::from(enabled)))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Backend;
    use crate::mock::{MockConnector, MockPrompt, MockRadio, MockScanner};
    use crate::responder::{Status, responder_channel};

    fn dispatcher() -> (CommandDispatcher, Arc<MockScanner>) {
        let scanner = Arc::new(MockScanner::new());
        let backend = Backend {
            scanner: scanner.clone(),
            radio: Arc::new(MockRadio::new(true)),
            prompt: Arc::new(MockPrompt::new()),
            connector: Arc::new(MockConnector::new()),
        };
        let engine = BeaconEngine::start(EngineConfig::default(), backend).unwrap();
        (CommandDispatcher::new(engine), scanner)
    }

    #[test]
    fn test_action_names_round_trip() {
        for action in Action::ALL {
            assert_eq!(action.name().parse::<Action>().unwrap(), action);
        }
        assert!("beacons_selfDestruct".parse::<Action>().is_err());
        assert!(Action::StartRanging.is_streaming());
        assert!(!Action::WriteMajor.is_streaming());
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_handled() {
        let (dispatcher, _) = dispatcher();
        let (responder, mut rx) = responder_channel();
        assert!(!dispatcher.dispatch("echo", &[], responder).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_region_leaves_engine_untouched() {
        let (dispatcher, scanner) = dispatcher();
        let (responder, mut rx) = responder_channel();
        let args = [json!({"uuid": "nope"})];
        assert!(
            dispatcher
                .dispatch("beacons_startRangingBeaconsInRegion", &args, responder)
                .await
        );

        let result = rx.recv().await.unwrap();
        assert_eq!(result.status, Status::Error);
        assert_eq!(result.payload.unwrap()["code"], "InvalidUuid");
        assert_eq!(dispatcher.engine().subscription_count().await, 0);
        assert_eq!(scanner.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_argument() {
        let (dispatcher, _) = dispatcher();
        let (responder, mut rx) = responder_channel();
        dispatcher
            .dispatch("beacons_setupAppIDAndAppToken", &[json!("app")], responder)
            .await;
        let result = rx.recv().await.unwrap();
        assert_eq!(result.payload.unwrap()["code"], "InvalidArgument");
    }

    #[tokio::test]
    async fn test_descriptor_without_identity_is_rejected() {
        let (dispatcher, _) = dispatcher();
        let (responder, mut rx) = responder_channel();
        dispatcher
            .dispatch("beacons_connectToBeacon", &[json!({"major": 1})], responder)
            .await;
        let result = rx.recv().await.unwrap();
        assert_eq!(result.payload.unwrap()["code"], "InvalidArgument");
    }

    #[tokio::test]
    async fn test_streaming_start_sends_nothing_until_data() {
        let (dispatcher, _) = dispatcher();
        let (responder, mut rx) = responder_channel();
        dispatcher
            .dispatch("beacons_startDiscoveringDevices", &[], responder)
            .await;
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.engine().subscription_count().await, 1);

        let (stop, mut stop_rx) = responder_channel();
        dispatcher
            .dispatch("beacons_stopDiscoveringDevices", &[], stop)
            .await;
        assert_eq!(rx.recv().await.unwrap().status, Status::NoResult);
        assert_eq!(stop_rx.recv().await.unwrap().status, Status::Ok);
    }

    #[tokio::test]
    async fn test_execute_spawns() {
        let (dispatcher, _) = dispatcher();
        let (responder, mut rx) = responder_channel();
        assert!(dispatcher.execute("bluetooth_bluetoothState", Vec::new(), responder));
        let result = rx.recv().await.unwrap();
        assert_eq!(result.payload, Some(json!(1)));
        assert!(!result.keep_callback);
    }
}
