//! Engine and scanner event types.
//!
//! Two event streams exist. [`ScannerEvent`]s flow from a
//! [`BeaconScanner`](crate::traits::BeaconScanner) into the engine's event
//! loop, which demultiplexes them onto subscriptions. [`EngineEvent`]s are
//! published by the engine on an [`EventDispatcher`] for diagnostics.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use beacon_types::{Beacon, ConfigurableDevice, MacAddress, Nearable, Region};

/// Raw callbacks delivered by the scanner.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ScannerEvent {
    /// A ranging window completed for a region.
    Ranged {
        /// The region being ranged.
        region: Region,
        /// Every beacon seen in the window.
        beacons: Vec<Beacon>,
    },
    /// A monitored region was entered.
    Entered(Region),
    /// A monitored region was exited.
    Exited(Region),
    /// Configurable devices broadcasting a connectivity packet.
    Discovered(Vec<ConfigurableDevice>),
    /// Nearables seen in the last window.
    Nearables(Vec<Nearable>),
    /// The scanner reported an error code.
    Error(i32),
}

/// Events published by the engine.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EngineEvent {
    /// The scanner reported a non-fatal error.
    ScannerError { code: i32 },
    /// The scan session finished its service-ready handshake.
    SessionStarted,
    /// The last subscription left and the scanner was released.
    SessionStopped,
    /// A device was connected and authorized.
    Connected { mac: MacAddress },
    /// A device link was closed.
    Disconnected {
        mac: MacAddress,
        reason: DisconnectReason,
    },
    /// A connection attempt failed.
    ConnectFailed { mac: MacAddress, reason: String },
}

/// Reason for disconnection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Host asked to disconnect.
    UserRequested,
    /// A connect to a different device took the slot.
    Preempted,
    /// Navigation reset or teardown.
    Reset,
    /// The link reported an error while closing.
    LinkError(String),
}

/// Sender for engine events.
pub type EventSender = broadcast::Sender<EngineEvent>;

/// Receiver for engine events.
pub type EventReceiver = broadcast::Receiver<EngineEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatcher_fan_out() {
        let dispatcher = EventDispatcher::new(8);
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 2);

        dispatcher.send(EngineEvent::SessionStarted);
        assert_eq!(a.recv().await.unwrap(), EngineEvent::SessionStarted);
        assert_eq!(b.recv().await.unwrap(), EngineEvent::SessionStarted);
    }

    #[test]
    fn test_send_without_receivers_is_silent() {
        let dispatcher = EventDispatcher::default();
        dispatcher.send(EngineEvent::SessionStopped);
        assert_eq!(dispatcher.receiver_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::Disconnected {
            mac: MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            reason: DisconnectReason::Preempted,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "disconnected");
        assert_eq!(json["mac"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(json["reason"], "Preempted");
    }
}
