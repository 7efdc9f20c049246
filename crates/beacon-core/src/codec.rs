//! Host-visible JSON encoding and argument decoding.
//!
//! UUIDs are rendered lowercase 8-4-4-4-12, MAC addresses as uppercase
//! colon-separated octets, and absent region filters as `null`.

use serde_json::{Map, Value, json};
use time::format_description::well_known::Rfc3339;

use beacon_types::uuid::{format_uuid, parse_proximity_uuid};
use beacon_types::{
    Beacon, ConfigurableDevice, DeviceDescriptor, DeviceInfo, Nearable, Region,
};

use crate::error::{Error, Result};

/// Region state reported by monitoring streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// The region was entered.
    Inside,
    /// The region was exited.
    Outside,
}

impl RegionState {
    /// Wire text.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inside => "inside",
            Self::Outside => "outside",
        }
    }
}

// --- Encoding ---

/// Distance as sent to hosts: finite and non-negative, or `-1`.
pub fn host_distance(distance: f64) -> f64 {
    if distance.is_finite() && distance >= 0.0 {
        distance
    } else {
        -1.0
    }
}

/// Encode a ranged beacon.
pub fn encode_beacon(beacon: &Beacon) -> Value {
    json!({
        "major": beacon.major,
        "minor": beacon.minor,
        "rssi": beacon.rssi,
        "measuredPower": beacon.measured_power,
        "proximityUUID": format_uuid(&beacon.proximity_uuid),
        "proximity": beacon.proximity().code(),
        "distance": host_distance(beacon.distance()),
        "macAddress": beacon.mac.to_string(),
        "uniqueKey": beacon.unique_key(),
    })
}

/// Encode a region, with the monitoring state when one applies.
pub fn encode_region(region: &Region, state: Option<RegionState>) -> Value {
    let mut obj = Map::new();
    obj.insert("identifier".into(), Value::from(region.identifier.clone()));
    obj.insert(
        "uuid".into(),
        region.uuid.as_ref().map(format_uuid).map_or(Value::Null, Value::from),
    );
    obj.insert("major".into(), region.major.map_or(Value::Null, Value::from));
    obj.insert("minor".into(), region.minor.map_or(Value::Null, Value::from));
    if let Some(state) = state {
        obj.insert("state".into(), Value::from(state.as_str()));
    }
    Value::Object(obj)
}

/// Encode one ranging stream element.
pub fn encode_ranging(region: &Region, beacons: &[Beacon]) -> Value {
    json!({
        "region": encode_region(region, None),
        "beacons": beacons.iter().map(encode_beacon).collect::<Vec<_>>(),
    })
}

/// Encode a configurable device.
pub fn encode_device(device: &ConfigurableDevice) -> Value {
    let discovery_time = device
        .discovery_time
        .format(&Rfc3339)
        .map_or(Value::Null, Value::from);
    json!({
        "macAddress": device.mac.to_string(),
        "type": device.device_type.as_str(),
        "txPower": device.tx_power,
        "appVersion": device.app_version,
        "bootloaderVersion": device.bootloader_version,
        "deviceId": device.device_id,
        "discoveryTime": discovery_time,
        "isClose": device.is_close,
        "isShaken": device.is_shaken,
        "rssi": device.rssi,
    })
}

/// Encode one discovery stream element.
pub fn encode_discovery(devices: &[ConfigurableDevice]) -> Value {
    json!({ "devices": devices.iter().map(encode_device).collect::<Vec<_>>() })
}

/// Encode a nearable.
pub fn encode_nearable(nearable: &Nearable) -> Value {
    json!({
        "identifier": nearable.identifier,
        "type": nearable.nearable_type.as_str(),
        "color": nearable.color,
        "firmware": nearable.firmware_version,
    })
}

/// Encode one nearable stream element.
pub fn encode_nearables(nearables: &[Nearable]) -> Value {
    Value::Array(nearables.iter().map(encode_nearable).collect())
}

/// Encode the snapshot of a connected device.
pub fn encode_device_info(info: &DeviceInfo) -> Value {
    json!({
        "batteryPercentage": info.battery_percentage,
        "color": info.color,
        "macAddress": info.mac.to_string(),
        "major": info.major,
        "minor": info.minor,
        "name": info.name,
        "uuid": format_uuid(&info.uuid),
        "settings": {
            "advertisingIntervalMillis": info.settings.advertising_interval_millis,
            "batteryLevel": info.settings.battery_level,
            "broadcastingPower": info.settings.broadcasting_power,
            "firmware": info.settings.firmware,
            "hardware": info.settings.hardware,
        },
    })
}

// --- Decoding ---

/// Fetch a positional argument.
pub fn arg(args: &[Value], index: usize) -> Result<&Value> {
    args.get(index)
        .ok_or_else(|| Error::invalid_argument(format!("missing argument {index}")))
}

/// Fetch a positional object argument.
pub fn arg_object(args: &[Value], index: usize) -> Result<&Map<String, Value>> {
    arg(args, index)?
        .as_object()
        .ok_or_else(|| Error::invalid_argument(format!("argument {index} must be an object")))
}

/// Fetch a positional string argument.
pub fn arg_str(args: &[Value], index: usize) -> Result<&str> {
    arg(args, index)?
        .as_str()
        .ok_or_else(|| Error::invalid_argument(format!("argument {index} must be a string")))
}

/// Lenient integer read: numbers, integral floats and numeric strings.
fn loose_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Optional u16 field: out of range, negative or malformed reads as absent.
fn opt_u16(obj: &Map<String, Value>, name: &str) -> Option<u16> {
    obj.get(name)
        .and_then(loose_int)
        .and_then(|v| u16::try_from(v).ok())
}

fn opt_str<'a>(obj: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    obj.get(name).and_then(Value::as_str)
}

/// Decode a `regionObj` argument.
///
/// A missing or empty `identifier` defaults to the region fingerprint. A
/// present but malformed `uuid` is an [`Error::InvalidUuid`].
pub fn parse_region(value: &Value) -> Result<Region> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::invalid_argument("region must be an object"))?;
    let uuid = match opt_str(obj, "uuid").map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Some(parse_proximity_uuid(s)?),
        None => None,
    };
    let identifier = opt_str(obj, "identifier").map(str::to_string);
    Ok(Region::new(
        identifier,
        uuid,
        opt_u16(obj, "major"),
        opt_u16(obj, "minor"),
    ))
}

/// Decode a `descriptorObj` argument.
///
/// Returns `None` when the object names neither a MAC nor a full identity
/// triple.
pub fn parse_descriptor(value: &Value) -> Result<Option<DeviceDescriptor>> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::invalid_argument("device descriptor must be an object"))?;
    let uuid = opt_str(obj, "proximityUUID").or_else(|| opt_str(obj, "uuid"));
    let major = obj.get("major").and_then(loose_int);
    let minor = obj.get("minor").and_then(loose_int);
    Ok(DeviceDescriptor::from_fields(
        opt_str(obj, "macAddress"),
        uuid,
        major,
        minor,
    )?)
}

/// Decode a major or minor to write. Zero and out-of-range values are rejected.
pub fn parse_identity_value(value: &Value, field: &str) -> Result<u16> {
    let raw = loose_int(value)
        .ok_or_else(|| Error::InvalidValue(format!("{field} must be an integer")))?;
    match u16::try_from(raw) {
        Ok(0) => Err(Error::InvalidValue(format!("{field} must be non-zero"))),
        Ok(v) => Ok(v),
        Err(_) => Err(Error::InvalidValue(format!(
            "{field} must be within 1..=65535, got {raw}"
        ))),
    }
}
