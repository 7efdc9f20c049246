//! Hardware integration tests for beacon-core
//!
//! These tests require a Bluetooth adapter and at least one iBeacon in range,
//! and should be run with:
//! ```text
//! cargo test --package beacon-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Set `BEACON_UUID` to range a specific proximity UUID instead of every
//! beacon in range.

use std::env;
use std::time::Duration;

use beacon_core::{BeaconScanner, BluetoothRadio, BtleRadio, BtleScanner, EngineConfig, ScannerEvent};
use beacon_types::Region;
use beacon_types::uuid::parse_proximity_uuid;
use tokio::time::timeout;

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(30);

fn target_region() -> Region {
    match env::var("BEACON_UUID") {
        Ok(raw) => {
            let uuid = parse_proximity_uuid(&raw).expect("BEACON_UUID is not a UUID");
            Region::with_uuid("hardware", uuid)
        }
        Err(_) => Region::any("hardware"),
    }
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_radio_reports_power_state() {
    let radio = BtleRadio::new().await.expect("no Bluetooth adapter");
    let powered = radio.is_powered().await.expect("adapter state unavailable");
    println!("Radio powered: {powered}");
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_ranging_reports_beacons() {
    let config = EngineConfig::default();
    let scanner = BtleScanner::new(&config);
    let mut events = scanner.subscribe();
    scanner.connect().await.expect("scanner handshake failed");
    let region = target_region();
    scanner.start_ranging(&region).await.unwrap();

    let found = timeout(BLE_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(ScannerEvent::Ranged { beacons, .. }) if !beacons.is_empty() => {
                    break beacons;
                }
                Ok(_) => continue,
                Err(e) => panic!("scanner channel failed: {e}"),
            }
        }
    })
    .await
    .expect("no beacons seen within 30 seconds");

    for beacon in &found {
        println!(
            "  {} {}/{} rssi={} distance={:.2}",
            beacon.proximity_uuid,
            beacon.major,
            beacon.minor,
            beacon.rssi,
            beacon.distance()
        );
        assert!(region.matches(beacon));
    }

    scanner.stop_ranging(&region).await.unwrap();
    scanner.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_monitoring_enters_region() {
    let config = EngineConfig::default();
    let scanner = BtleScanner::new(&config);
    let mut events = scanner.subscribe();
    scanner.connect().await.expect("scanner handshake failed");
    let region = target_region();
    scanner.start_monitoring(&region).await.unwrap();

    let entered = timeout(BLE_TIMEOUT, async {
        loop {
            if let Ok(ScannerEvent::Entered(r)) = events.recv().await {
                break r;
            }
        }
    })
    .await
    .expect("region never entered");
    assert_eq!(entered.identifier, region.identifier);

    scanner.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_reconnect_after_disconnect() {
    let scanner = BtleScanner::new(&EngineConfig::default());
    for _ in 0..2 {
        scanner.connect().await.expect("scanner handshake failed");
        scanner.start_discovery().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        scanner.disconnect().await.unwrap();
    }
}
