//! BLE advertisement frame parsing.
//!
//! Three frame kinds feed the engine:
//!
//! - **iBeacon** frames in Apple manufacturer data (company id 0x004C), which
//!   become [`Beacon`]s for ranging and monitoring
//! - **Nearable** frames in Estimote manufacturer data (company id 0x015D)
//! - **Connectivity** packets in service data for the Estimote service
//!   (0xFE9A), which mark a device as configurable
//!
//! All parsers take the payload without the company identifier, as delivered
//! by `btleplug`'s `manufacturer_data` and `service_data` maps.

use bytes::Buf;
use time::OffsetDateTime;
use uuid::Uuid;

use beacon_types::uuid::{IBEACON_PAYLOAD_LEN, IBEACON_TYPE};
use beacon_types::{
    Beacon, ConfigurableDevice, ConfigurableDeviceType, MacAddress, Nearable, NearableType,
    ParseError, ParseResult,
};

/// Length of an iBeacon payload after the company identifier.
pub const IBEACON_FRAME_LEN: usize = 23;

/// Nearable frame marker.
pub const NEARABLE_FRAME_TYPE: u8 = 0x01;

/// Minimum length of a nearable frame.
pub const NEARABLE_FRAME_LEN: usize = 12;

/// Connectivity packet marker.
pub const CONNECTIVITY_FRAME_TYPE: u8 = 0x02;

/// Minimum length of a connectivity packet.
pub const CONNECTIVITY_FRAME_LEN: usize = 14;

/// RSSI at or above which a configurable device counts as held close.
pub const CLOSE_RSSI_THRESHOLD: i16 = -50;

const SHAKEN_FLAG: u8 = 0x01;

const NEARABLE_COLORS: [&str; 7] = [
    "unknown",
    "mint cocktail",
    "ice",
    "blueberry",
    "lemon tart",
    "sweet beetroot",
    "coconut puff",
];

fn ensure_len(data: &[u8], expected: usize) -> ParseResult<()> {
    if data.len() < expected {
        return Err(ParseError::InsufficientBytes {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn take_hex_id(buf: &mut &[u8], len: usize) -> String {
    let mut id = String::with_capacity(len * 2);
    for _ in 0..len {
        id.push_str(&format!("{:02x}", buf.get_u8()));
    }
    id
}

fn nibble_version(byte: u8) -> String {
    format!("{}.{}", byte >> 4, byte & 0x0F)
}

/// Parse an iBeacon frame.
///
/// Layout: type `0x02`, length `0x15`, 16-byte proximity UUID, big-endian
/// major and minor, signed measured power.
///
/// # Examples
///
/// ```
/// use beacon_core::advertisement::parse_ibeacon;
/// use beacon_types::MacAddress;
///
/// let mut frame = vec![0x02, 0x15];
/// frame.extend_from_slice(&beacon_types::uuid::ESTIMOTE_PROXIMITY_UUID.into_bytes());
/// frame.extend_from_slice(&[0x00, 0x01, 0x00, 0x02, 0xC5]);
///
/// let beacon = parse_ibeacon(&frame, MacAddress::default(), -70).unwrap();
/// assert_eq!((beacon.major, beacon.minor, beacon.measured_power), (1, 2, -59));
/// ```
pub fn parse_ibeacon(data: &[u8], mac: MacAddress, rssi: i16) -> ParseResult<Beacon> {
    ensure_len(data, IBEACON_FRAME_LEN)?;
    let mut buf = data;

    let frame_type = buf.get_u8();
    let payload_len = buf.get_u8();
    if frame_type != IBEACON_TYPE || payload_len != IBEACON_PAYLOAD_LEN {
        return Err(ParseError::InvalidValue(format!(
            "not an iBeacon frame: 0x{frame_type:02X} 0x{payload_len:02X}"
        )));
    }

    let mut uuid = [0u8; 16];
    buf.copy_to_slice(&mut uuid);
    let major = buf.get_u16();
    let minor = buf.get_u16();
    let measured_power = buf.get_i8();

    Ok(Beacon::new(
        Uuid::from_bytes(uuid),
        major,
        minor,
        mac,
        rssi,
        measured_power,
    ))
}

/// Parse a nearable frame.
///
/// Layout: marker `0x01`, 8-byte identifier, type code, colour code,
/// firmware version (major and minor nibbles), then sensor bytes that are
/// not decoded.
pub fn parse_nearable(data: &[u8]) -> ParseResult<Nearable> {
    ensure_len(data, NEARABLE_FRAME_LEN)?;
    let mut buf = data;

    let marker = buf.get_u8();
    if marker != NEARABLE_FRAME_TYPE {
        return Err(ParseError::InvalidValue(format!(
            "not a nearable frame: 0x{marker:02X}"
        )));
    }
    let identifier = take_hex_id(&mut buf, 8);
    let nearable_type = NearableType::from_code(buf.get_u8());
    let color = NEARABLE_COLORS
        .get(usize::from(buf.get_u8()))
        .copied()
        .unwrap_or(NEARABLE_COLORS[0]);
    let firmware_version = nibble_version(buf.get_u8());

    Ok(Nearable {
        identifier,
        nearable_type,
        color: color.to_string(),
        firmware_version,
    })
}

/// Parse a connectivity packet.
///
/// Layout: marker `0x02`, 8-byte device id, hardware type code, signed TX
/// power, application version, bootloader version (both as major and minor
/// nibbles), flags (bit 0: shaken).
pub fn parse_connectivity(
    data: &[u8],
    mac: MacAddress,
    rssi: i16,
    discovery_time: OffsetDateTime,
) -> ParseResult<ConfigurableDevice> {
    ensure_len(data, CONNECTIVITY_FRAME_LEN)?;
    let mut buf = data;

    let marker = buf.get_u8();
    if marker != CONNECTIVITY_FRAME_TYPE {
        return Err(ParseError::InvalidValue(format!(
            "not a connectivity packet: 0x{marker:02X}"
        )));
    }
    let device_id = take_hex_id(&mut buf, 8);
    let device_type = ConfigurableDeviceType::from_code(buf.get_u8());
    let tx_power = buf.get_i8();
    let app_version = nibble_version(buf.get_u8());
    let bootloader_version = nibble_version(buf.get_u8());
    let flags = buf.get_u8();

    Ok(ConfigurableDevice {
        mac,
        device_type,
        tx_power,
        app_version,
        bootloader_version,
        device_id,
        discovery_time,
        is_close: rssi >= CLOSE_RSSI_THRESHOLD,
        is_shaken: flags & SHAKEN_FLAG != 0,
        rssi,
    })
}
