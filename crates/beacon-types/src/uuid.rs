//! Well-known identifiers for proximity beacons.
//!
//! This module contains the UUIDs, company identifiers and frame markers
//! needed to recognise beacon advertisements over Bluetooth Low Energy.

use uuid::{Uuid, uuid};

use crate::error::{ParseError, ParseResult};

// --- Proximity UUIDs ---

/// Factory default proximity UUID of Estimote beacons.
pub const ESTIMOTE_PROXIMITY_UUID: Uuid = uuid!("b9407f30-f5f8-466e-aff9-25556b57fe6d");

/// Identifier of the sample region used by host applications.
pub const ESTIMOTE_SAMPLE_REGION_ID: &str = "EstimoteSampleRegion";

// --- Company identifiers (manufacturer data keys) ---

/// Apple company identifier, carrier of iBeacon frames.
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Estimote company identifier, carrier of nearable frames.
pub const ESTIMOTE_COMPANY_ID: u16 = 0x015D;

// --- Service UUIDs ---

/// Estimote service UUID advertised by configurable devices.
pub const ESTIMOTE_SERVICE: Uuid = uuid!("0000fe9a-0000-1000-8000-00805f9b34fb");

// --- iBeacon frame markers ---

/// iBeacon frame type byte.
pub const IBEACON_TYPE: u8 = 0x02;

/// iBeacon payload length byte (21 bytes follow).
pub const IBEACON_PAYLOAD_LEN: u8 = 0x15;

/// Parse a proximity UUID in canonical 8-4-4-4-12 form.
///
/// Case is ignored. Simple, braced and URN forms are rejected so that only
/// the representation hosts actually send is accepted.
///
/// # Examples
///
/// ```
/// use beacon_types::uuid::{parse_proximity_uuid, ESTIMOTE_PROXIMITY_UUID};
///
/// let uuid = parse_proximity_uuid("B9407F30-F5F8-466E-AFF9-25556B57FE6D").unwrap();
/// assert_eq!(uuid, ESTIMOTE_PROXIMITY_UUID);
/// assert!(parse_proximity_uuid("not-a-uuid").is_err());
/// ```
pub fn parse_proximity_uuid(s: &str) -> ParseResult<Uuid> {
    let trimmed = s.trim();
    let hyphens_ok = trimmed.len() == 36
        && trimmed
            .char_indices()
            .all(|(i, c)| matches!(i, 8 | 13 | 18 | 23) == (c == '-'));
    if !hyphens_ok {
        return Err(ParseError::InvalidUuid(s.to_string()));
    }
    Uuid::try_parse(trimmed).map_err(|_| ParseError::InvalidUuid(s.to_string()))
}

/// Render a UUID as a lowercase 8-4-4-4-12 string.
pub fn format_uuid(uuid: &Uuid) -> String {
    uuid.hyphenated().to_string()
}
