//! Most recent observations, read by connection commands.
//!
//! The beacon list is replaced wholesale by every ranging callback, across
//! all regions; it is never accumulated. The discovered-device list is
//! likewise replaced by every discovery callback.

use tokio::sync::RwLock;
use tracing::trace;
use uuid::Uuid;

use beacon_types::{Beacon, ConfigurableDevice, DeviceDescriptor, MacAddress};

/// Snapshot store for ranged beacons and discovered configurable devices.
#[derive(Debug, Default)]
pub struct ObservationCache {
    beacons: RwLock<Vec<Beacon>>,
    devices: RwLock<Vec<ConfigurableDevice>>,
}

impl ObservationCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the ranged beacons with the latest batch.
    pub async fn replace_beacons(&self, beacons: Vec<Beacon>) {
        trace!(count = beacons.len(), "replacing ranged beacons");
        *self.beacons.write().await = beacons;
    }

    /// Replace the discovered devices with the latest batch.
    pub async fn replace_devices(&self, devices: Vec<ConfigurableDevice>) {
        trace!(count = devices.len(), "replacing discovered devices");
        *self.devices.write().await = devices;
    }

    /// Copy of the ranged beacons.
    pub async fn beacons(&self) -> Vec<Beacon> {
        self.beacons.read().await.clone()
    }

    /// Copy of the discovered devices.
    pub async fn devices(&self) -> Vec<ConfigurableDevice> {
        self.devices.read().await.clone()
    }

    /// Find a ranged beacon by address.
    pub async fn find_by_mac(&self, mac: &MacAddress) -> Option<Beacon> {
        self.beacons
            .read()
            .await
            .iter()
            .find(|b| b.mac == *mac)
            .cloned()
    }

    /// Find a ranged beacon by its full identity triple.
    pub async fn find_by_triple(&self, uuid: &Uuid, major: u16, minor: u16) -> Option<Beacon> {
        self.beacons
            .read()
            .await
            .iter()
            .find(|b| b.has_identity(uuid, major, minor))
            .cloned()
    }

    /// Find a ranged beacon from a host descriptor.
    pub async fn find_from_descriptor(&self, descriptor: &DeviceDescriptor) -> Option<Beacon> {
        match descriptor {
            DeviceDescriptor::ByMac(mac) => self.find_by_mac(mac).await,
            DeviceDescriptor::ByTriple { uuid, major, minor } => {
                self.find_by_triple(uuid, *major, *minor).await
            }
        }
    }

    /// Find a discovered configurable device.
    ///
    /// Connectivity packets carry no identity triple, so only address-based
    /// descriptors can match.
    pub async fn find_device(&self, descriptor: &DeviceDescriptor) -> Option<ConfigurableDevice> {
        let mac = descriptor.mac()?;
        self.devices
            .read()
            .await
            .iter()
            .find(|d| d.mac == mac)
            .cloned()
    }

    /// Drop every observation.
    pub async fn clear(&self) {
        self.beacons.write().await.clear();
        self.devices.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_types::ConfigurableDeviceType;
    use beacon_types::uuid::ESTIMOTE_PROXIMITY_UUID;
    use time::OffsetDateTime;

    fn beacon(last: u8, major: u16, minor: u16) -> Beacon {
        Beacon::new(
            ESTIMOTE_PROXIMITY_UUID,
            major,
            minor,
            MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last]),
            -65,
            -59,
        )
    }

    fn device(last: u8) -> ConfigurableDevice {
        ConfigurableDevice {
            mac: MacAddress::new([0x11, 0x22, 0x33, 0x44, 0x55, last]),
            device_type: ConfigurableDeviceType::LocationBeacon,
            tx_power: -4,
            app_version: "4.13.2".into(),
            bootloader_version: "3.2.0".into(),
            device_id: "a1b2c3d4".into(),
            discovery_time: OffsetDateTime::UNIX_EPOCH,
            is_close: false,
            is_shaken: false,
            rssi: -70,
        }
    }

    #[tokio::test]
    async fn test_replace_is_not_accumulative() {
        let cache = ObservationCache::new();
        cache.replace_beacons(vec![beacon(1, 1, 1), beacon(2, 1, 2)]).await;
        cache.replace_beacons(vec![beacon(3, 1, 3)]).await;

        let beacons = cache.beacons().await;
        assert_eq!(beacons.len(), 1);
        assert_eq!(beacons[0].minor, 3);
        assert!(cache.find_by_mac(&beacon(1, 1, 1).mac).await.is_none());
    }

    #[tokio::test]
    async fn test_find_by_mac_and_triple() {
        let cache = ObservationCache::new();
        cache.replace_beacons(vec![beacon(1, 10, 20), beacon(2, 10, 21)]).await;

        let found = cache.find_by_mac(&beacon(2, 0, 0).mac).await.unwrap();
        assert_eq!(found.minor, 21);

        let found = cache
            .find_by_triple(&ESTIMOTE_PROXIMITY_UUID, 10, 20)
            .await
            .unwrap();
        assert_eq!(found.mac, beacon(1, 0, 0).mac);

        assert!(cache.find_by_triple(&ESTIMOTE_PROXIMITY_UUID, 10, 22).await.is_none());
        assert!(cache.find_by_triple(&Uuid::nil(), 10, 20).await.is_none());
    }

    #[tokio::test]
    async fn test_find_from_descriptor() {
        let cache = ObservationCache::new();
        cache.replace_beacons(vec![beacon(1, 10, 20)]).await;

        let by_mac = DeviceDescriptor::ByMac(beacon(1, 0, 0).mac);
        assert!(cache.find_from_descriptor(&by_mac).await.is_some());

        let by_triple = DeviceDescriptor::ByTriple {
            uuid: ESTIMOTE_PROXIMITY_UUID,
            major: 10,
            minor: 20,
        };
        assert!(cache.find_from_descriptor(&by_triple).await.is_some());
    }

    #[tokio::test]
    async fn test_find_device_by_mac_only() {
        let cache = ObservationCache::new();
        cache.replace_devices(vec![device(1), device(2)]).await;

        let found = cache
            .find_device(&DeviceDescriptor::ByMac(device(2).mac))
            .await
            .unwrap();
        assert_eq!(found.mac, device(2).mac);

        let by_triple = DeviceDescriptor::ByTriple {
            uuid: ESTIMOTE_PROXIMITY_UUID,
            major: 1,
            minor: 1,
        };
        assert!(cache.find_device(&by_triple).await.is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = ObservationCache::new();
        cache.replace_beacons(vec![beacon(1, 1, 1)]).await;
        cache.replace_devices(vec![device(1)]).await;
        cache.clear().await;
        assert!(cache.beacons().await.is_empty());
        assert!(cache.devices().await.is_empty());
    }
}
