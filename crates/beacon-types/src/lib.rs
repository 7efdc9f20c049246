//! Platform-agnostic types for BLE proximity beacons.
//!
//! This crate provides the shared data model used by the beacon engine
//! (beacon-core) and by any host binding that needs to speak its language.
//!
//! # Features
//!
//! - Beacon observations with distance and proximity estimation
//! - Regions and their canonical fingerprint keys
//! - Configurable devices, nearables and connected-device snapshots
//! - Well-known UUIDs and company identifiers
//! - Error types for identity parsing
//!
//! # Example
//!
//! ```
//! use beacon_types::{Beacon, MacAddress, Region, uuid::ESTIMOTE_PROXIMITY_UUID};
//!
//! let region = Region::with_uuid("office", ESTIMOTE_PROXIMITY_UUID).major(1);
//! let beacon = Beacon::new(
//!     ESTIMOTE_PROXIMITY_UUID,
//!     1,
//!     2,
//!     "AA:BB:CC:DD:EE:FF".parse::<MacAddress>().unwrap(),
//!     -70,
//!     -59,
//! );
//! assert!(region.matches(&beacon));
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{
    Beacon, ConfigurableDevice, ConfigurableDeviceType, DeviceDescriptor, DeviceInfo,
    DeviceSettings, MacAddress, Nearable, NearableType, Proximity, Region, RegionKey,
    estimate_distance,
};

#[cfg(test)]
mod tests {
    use super::*;
    use ::uuid::Uuid;
    use proptest::prelude::*;

    use crate::uuid::ESTIMOTE_PROXIMITY_UUID;

    fn mac() -> MacAddress {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    // --- MacAddress ---

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddress = "aa:bb:cc:dd:ee:0f".parse().unwrap();
        assert_eq!(mac.to_string(), "AA:BB:CC:DD:EE:0F");
        assert_eq!(mac.octets(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x0F]);

        let dashed: MacAddress = "AA-BB-CC-DD-EE-0F".parse().unwrap();
        assert_eq!(mac, dashed);
    }

    #[test]
    fn test_mac_parse_rejects_garbage() {
        assert!("".parse::<MacAddress>().is_err());
        assert!("AA:BB:CC:DD:EE".parse::<MacAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<MacAddress>().is_err());
        assert!("AAA:BB:CC:DD:EE:FF".parse::<MacAddress>().is_err());
        assert!(MacAddress::default().is_zero());
    }

    #[test]
    fn test_mac_serde_as_string() {
        let json = serde_json::to_string(&mac()).unwrap();
        assert_eq!(json, "\"AA:BB:CC:DD:EE:FF\"");
        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac());
    }

    // --- Region matching and fingerprints ---

    #[test]
    fn test_region_without_filters_matches_any_beacon() {
        let region = Region::any("all");
        let beacon = Beacon::new(Uuid::new_v4(), 9, 9, mac(), -60, -59);
        assert!(region.matches(&beacon));
    }

    #[test]
    fn test_region_present_fields_must_match() {
        let beacon = Beacon::new(ESTIMOTE_PROXIMITY_UUID, 1, 2, mac(), -60, -59);
        assert!(Region::with_uuid("r", ESTIMOTE_PROXIMITY_UUID).matches(&beacon));
        assert!(Region::with_uuid("r", ESTIMOTE_PROXIMITY_UUID).major(1).matches(&beacon));
        assert!(!Region::with_uuid("r", ESTIMOTE_PROXIMITY_UUID).major(3).matches(&beacon));
        assert!(!Region::with_uuid("r", Uuid::new_v4()).matches(&beacon));
        assert!(!Region::any("r").minor(5).matches(&beacon));
    }

    #[test]
    fn test_region_identifier_defaults_to_fingerprint() {
        let region = Region::new(None, Some(ESTIMOTE_PROXIMITY_UUID), Some(1), None);
        assert_eq!(
            region.identifier,
            "b9407f30-f5f8-466e-aff9-25556b57fe6d%1%0"
        );
        assert_eq!(region.key().as_str(), region.identifier);

        let named = Region::new(Some(String::new()), None, None, None);
        assert_eq!(named.identifier, "0%0%0");
    }

    #[test]
    fn test_region_key_ignores_identifier() {
        let a = Region::with_uuid("a", ESTIMOTE_PROXIMITY_UUID).major(4);
        let b = Region::with_uuid("b", ESTIMOTE_PROXIMITY_UUID).major(4);
        assert_eq!(a.key(), b.key());
    }

    // --- Beacon derived values ---

    #[test]
    fn test_beacon_far_at_minus_70() {
        let beacon = Beacon::new(ESTIMOTE_PROXIMITY_UUID, 1, 2, mac(), -70, -59);
        assert!(beacon.distance() > 0.0);
        assert!(matches!(beacon.proximity(), Proximity::Near | Proximity::Far));
    }

    #[test]
    fn test_beacon_immediate_when_strong() {
        let beacon = Beacon::new(ESTIMOTE_PROXIMITY_UUID, 1, 2, mac(), -40, -59);
        assert_eq!(beacon.proximity(), Proximity::Immediate);
    }

    #[test]
    fn test_beacon_unknown_when_rssi_zero() {
        let beacon = Beacon::new(ESTIMOTE_PROXIMITY_UUID, 1, 2, mac(), 0, -59);
        assert_eq!(beacon.distance(), -1.0);
        assert_eq!(beacon.proximity(), Proximity::Unknown);
        assert_eq!(beacon.proximity().code(), 0);
    }

    #[test]
    fn test_beacon_unique_key() {
        let beacon = Beacon::new(ESTIMOTE_PROXIMITY_UUID, 10, 20, mac(), -60, -59);
        assert_eq!(
            beacon.unique_key(),
            "b9407f30-f5f8-466e-aff9-25556b57fe6d:10:20"
        );
        assert!(beacon.has_identity(&ESTIMOTE_PROXIMITY_UUID, 10, 20));
        assert!(!beacon.has_identity(&ESTIMOTE_PROXIMITY_UUID, 10, 21));
    }

    // --- DeviceDescriptor ---

    #[test]
    fn test_descriptor_prefers_mac() {
        let d = DeviceDescriptor::from_fields(
            Some("AA:BB:CC:DD:EE:FF"),
            Some("b9407f30-f5f8-466e-aff9-25556b57fe6d"),
            Some(1),
            Some(2),
        )
        .unwrap();
        assert_eq!(d, Some(DeviceDescriptor::ByMac(mac())));
    }

    #[test]
    fn test_descriptor_triple_requires_all_fields() {
        let uuid = "b9407f30-f5f8-466e-aff9-25556b57fe6d";
        let full = DeviceDescriptor::from_fields(Some(""), Some(uuid), Some(0), Some(7)).unwrap();
        assert_eq!(
            full,
            Some(DeviceDescriptor::ByTriple {
                uuid: ESTIMOTE_PROXIMITY_UUID,
                major: 0,
                minor: 7
            })
        );

        let negative = DeviceDescriptor::from_fields(None, Some(uuid), Some(-1), Some(7)).unwrap();
        assert_eq!(negative, None);

        let too_big = DeviceDescriptor::from_fields(None, Some(uuid), Some(1), Some(70_000)).unwrap();
        assert_eq!(too_big, None);
    }

    #[test]
    fn test_descriptor_bad_mac_is_error() {
        let result = DeviceDescriptor::from_fields(Some("zz"), None, None, None);
        assert!(matches!(result, Err(ParseError::InvalidMac(_))));
    }

    // --- Type codes ---

    #[test]
    fn test_type_codes() {
        assert_eq!(NearableType::from_code(0x02), NearableType::Car);
        assert_eq!(NearableType::from_code(0xEE), NearableType::Unknown);
        assert_eq!(NearableType::Shoe.as_str(), "Shoe");
        assert_eq!(
            ConfigurableDeviceType::from_code(0x02).as_str(),
            "LOCATION_BEACON"
        );
    }

    // --- Properties ---

    fn opt_triple() -> impl Strategy<Value = (Option<u128>, Option<u16>, Option<u16>)> {
        (
            proptest::option::of(prop_oneof![Just(0u128), Just(1u128), any::<u128>()]),
            proptest::option::of(prop_oneof![Just(0u16), Just(1u16), any::<u16>()]),
            proptest::option::of(prop_oneof![Just(0u16), Just(1u16), any::<u16>()]),
        )
    }

    proptest! {
        #[test]
        fn prop_fingerprint_equality_matches_triple_equality(
            a in opt_triple(),
            b in opt_triple(),
        ) {
            let region = |(u, ma, mi): (Option<u128>, Option<u16>, Option<u16>)| {
                Region::new(Some("r".into()), u.map(Uuid::from_u128), ma, mi)
            };
            let normalise = |(u, ma, mi): (Option<u128>, Option<u16>, Option<u16>)| {
                (u.unwrap_or(0), ma.unwrap_or(0), mi.unwrap_or(0))
            };
            let same_key = region(a).key() == region(b).key();
            prop_assert_eq!(same_key, normalise(a) == normalise(b));
        }

        #[test]
        fn prop_distance_sentinel_or_non_negative(rssi in any::<i16>(), power in any::<i8>()) {
            let d = estimate_distance(rssi, power);
            if rssi == 0 || power == 0 {
                prop_assert_eq!(d, -1.0);
            } else {
                prop_assert!(d >= 0.0);
            }
        }

        #[test]
        fn prop_mac_display_roundtrips(octets in any::<[u8; 6]>()) {
            let mac = MacAddress::new(octets);
            let parsed: MacAddress = mac.to_string().parse().unwrap();
            prop_assert_eq!(parsed, mac);
        }
    }
}
