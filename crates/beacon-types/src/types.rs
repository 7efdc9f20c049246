//! Core types for beacon observation and management.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ParseError, ParseResult};
use crate::uuid::{format_uuid, parse_proximity_uuid};

/// A 48-bit Bluetooth device address.
///
/// Displayed as six colon-separated uppercase hex octets
/// (`AA:BB:CC:DD:EE:FF`). Parsing is case-insensitive and also accepts `-`
/// as the separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Create an address from raw octets (most significant first).
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The raw octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether this is the all-zero placeholder address.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        let invalid = || ParseError::InvalidMac(s.to_string());
        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(invalid());
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

#[cfg(feature = "serde")]
impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Coarse proximity bucket derived from the estimated distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[repr(u8)]
pub enum Proximity {
    /// Distance could not be estimated.
    #[default]
    Unknown = 0,
    /// Within half a metre.
    Immediate = 1,
    /// Within three metres.
    Near = 2,
    /// Further than three metres.
    Far = 3,
}

impl Proximity {
    /// Upper bound (exclusive) of the immediate zone in metres.
    pub const IMMEDIATE_LIMIT: f64 = 0.5;
    /// Upper bound (inclusive) of the near zone in metres.
    pub const NEAR_LIMIT: f64 = 3.0;

    /// Bucket an estimated distance.
    ///
    /// # Examples
    ///
    /// ```
    /// use beacon_types::Proximity;
    ///
    /// assert_eq!(Proximity::from_distance(-1.0), Proximity::Unknown);
    /// assert_eq!(Proximity::from_distance(0.2), Proximity::Immediate);
    /// assert_eq!(Proximity::from_distance(2.0), Proximity::Near);
    /// assert_eq!(Proximity::from_distance(9.0), Proximity::Far);
    /// ```
    #[must_use]
    pub fn from_distance(distance: f64) -> Self {
        if !distance.is_finite() || distance < 0.0 {
            Proximity::Unknown
        } else if distance < Self::IMMEDIATE_LIMIT {
            Proximity::Immediate
        } else if distance <= Self::NEAR_LIMIT {
            Proximity::Near
        } else {
            Proximity::Far
        }
    }

    /// Numeric code sent to hosts (0..=3).
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Estimate the distance in metres from RSSI and the calibrated power at 1 m.
///
/// Uses the log-distance fit common to iBeacon SDKs. Returns `-1.0` when either
/// input is zero, since no estimate is possible.
///
/// # Examples
///
/// ```
/// use beacon_types::estimate_distance;
///
/// assert_eq!(estimate_distance(0, -59), -1.0);
/// assert!((estimate_distance(-59, -59) - 1.01076).abs() < 1e-3);
/// assert!(estimate_distance(-70, -59) > 3.0);
/// ```
#[must_use]
pub fn estimate_distance(rssi: i16, measured_power: i8) -> f64 {
    if rssi == 0 || measured_power == 0 {
        return -1.0;
    }
    let ratio = f64::from(rssi) / f64::from(measured_power);
    if ratio < 1.0 {
        ratio.powi(10)
    } else {
        0.89976 * ratio.powf(7.7095) + 0.111
    }
}

/// A single iBeacon advertisement observed by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Beacon {
    /// 128-bit proximity UUID.
    pub proximity_uuid: Uuid,
    /// Major identifier.
    pub major: u16,
    /// Minor identifier.
    pub minor: u16,
    /// Bluetooth address of the transmitter.
    pub mac: MacAddress,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Calibrated signal strength at 1 m in dBm.
    pub measured_power: i8,
}

impl Beacon {
    /// Create a beacon observation.
    #[must_use]
    pub fn new(
        proximity_uuid: Uuid,
        major: u16,
        minor: u16,
        mac: MacAddress,
        rssi: i16,
        measured_power: i8,
    ) -> Self {
        Self {
            proximity_uuid,
            major,
            minor,
            mac,
            rssi,
            measured_power,
        }
    }

    /// Estimated distance in metres, or a negative value when unknown.
    #[must_use]
    pub fn distance(&self) -> f64 {
        estimate_distance(self.rssi, self.measured_power)
    }

    /// Proximity bucket for the estimated distance.
    #[must_use]
    pub fn proximity(&self) -> Proximity {
        Proximity::from_distance(self.distance())
    }

    /// Stable key identifying the beacon by its identity triple.
    #[must_use]
    pub fn unique_key(&self) -> String {
        format!(
            "{}:{}:{}",
            format_uuid(&self.proximity_uuid),
            self.major,
            self.minor
        )
    }

    /// Whether the beacon carries the given identity triple.
    #[must_use]
    pub fn has_identity(&self, uuid: &Uuid, major: u16, minor: u16) -> bool {
        self.proximity_uuid == *uuid && self.major == major && self.minor == minor
    }
}

/// Canonical subscription key derived from a region's filter fields.
///
/// Rendered as `<uuid-or-0>%<major-or-0>%<minor-or-0>`. Absent fields and
/// zero values (including the nil UUID) render identically, so two regions
/// share a key exactly when their triples are equal with absent treated as 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct RegionKey(String);

impl RegionKey {
    /// Build a key from optional filter fields.
    ///
    /// # Examples
    ///
    /// ```
    /// use beacon_types::RegionKey;
    ///
    /// assert_eq!(RegionKey::from_parts(None, None, None).as_str(), "0%0%0");
    /// assert_eq!(RegionKey::from_parts(None, Some(7), None).as_str(), "0%7%0");
    /// ```
    #[must_use]
    pub fn from_parts(uuid: Option<&Uuid>, major: Option<u16>, minor: Option<u16>) -> Self {
        let uuid = match uuid {
            Some(u) if !u.is_nil() => format_uuid(u),
            _ => "0".to_string(),
        };
        Self(format!(
            "{}%{}%{}",
            uuid,
            major.unwrap_or(0),
            minor.unwrap_or(0)
        ))
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A beacon region: an identifier plus optional identity filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Region {
    /// Host-chosen region identifier.
    pub identifier: String,
    /// Proximity UUID filter.
    pub uuid: Option<Uuid>,
    /// Major filter.
    pub major: Option<u16>,
    /// Minor filter.
    pub minor: Option<u16>,
}

impl Region {
    /// Create a region; an empty identifier defaults to the fingerprint.
    #[must_use]
    pub fn new(
        identifier: Option<String>,
        uuid: Option<Uuid>,
        major: Option<u16>,
        minor: Option<u16>,
    ) -> Self {
        let identifier = identifier
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| RegionKey::from_parts(uuid.as_ref(), major, minor).0);
        Self {
            identifier,
            uuid,
            major,
            minor,
        }
    }

    /// A region matching every beacon.
    #[must_use]
    pub fn any(identifier: impl Into<String>) -> Self {
        Self::new(Some(identifier.into()), None, None, None)
    }

    /// A region matching every beacon with the given proximity UUID.
    #[must_use]
    pub fn with_uuid(identifier: impl Into<String>, uuid: Uuid) -> Self {
        Self::new(Some(identifier.into()), Some(uuid), None, None)
    }

    /// Narrow the region to a major value.
    #[must_use]
    pub fn major(mut self, major: u16) -> Self {
        self.major = Some(major);
        self
    }

    /// Narrow the region to a minor value.
    #[must_use]
    pub fn minor(mut self, minor: u16) -> Self {
        self.minor = Some(minor);
        self
    }

    /// Fingerprint used as the subscription key.
    #[must_use]
    pub fn key(&self) -> RegionKey {
        RegionKey::from_parts(self.uuid.as_ref(), self.major, self.minor)
    }

    /// Whether every present filter field equals the beacon's.
    #[must_use]
    pub fn matches(&self, beacon: &Beacon) -> bool {
        self.uuid.is_none_or(|u| u == beacon.proximity_uuid)
            && self.major.is_none_or(|m| m == beacon.major)
            && self.minor.is_none_or(|m| m == beacon.minor)
    }
}

/// Kind of a configurable device, as reported by its connectivity packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum ConfigurableDeviceType {
    /// Proximity beacon.
    ProximityBeacon,
    /// Location beacon.
    LocationBeacon,
    /// Nearable sticker.
    Nearable,
    /// Unrecognised hardware.
    #[default]
    Unknown,
}

impl ConfigurableDeviceType {
    /// Detect the type from the frame's hardware nibble.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::ProximityBeacon,
            0x02 => Self::LocationBeacon,
            0x03 => Self::Nearable,
            _ => Self::Unknown,
        }
    }

    /// Name reported to hosts.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProximityBeacon => "PROXIMITY_BEACON",
            Self::LocationBeacon => "LOCATION_BEACON",
            Self::Nearable => "NEARABLE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// A beacon currently broadcasting a connectivity packet and eligible for management.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConfigurableDevice {
    /// Bluetooth address.
    pub mac: MacAddress,
    /// Hardware kind.
    pub device_type: ConfigurableDeviceType,
    /// Transmit power in dBm.
    pub tx_power: i8,
    /// Application firmware version.
    pub app_version: String,
    /// Bootloader version.
    pub bootloader_version: String,
    /// Short device identifier (hex).
    pub device_id: String,
    /// When the connectivity packet was received.
    pub discovery_time: OffsetDateTime,
    /// Whether the device is held close to the receiver.
    pub is_close: bool,
    /// Whether the device was recently shaken.
    pub is_shaken: bool,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// Type of an Estimote nearable sticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum NearableType {
    /// Dog collar.
    Dog,
    /// Car.
    Car,
    /// Fridge.
    Fridge,
    /// Bag.
    Bag,
    /// Bike.
    Bike,
    /// Chair.
    Chair,
    /// Bed.
    Bed,
    /// Door.
    Door,
    /// Shoe.
    Shoe,
    /// Generic sticker.
    Generic,
    /// Unrecognised type code.
    #[default]
    Unknown,
}

impl NearableType {
    /// Map the type code carried in the advertisement.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::Dog,
            0x02 => Self::Car,
            0x03 => Self::Fridge,
            0x04 => Self::Bag,
            0x05 => Self::Bike,
            0x06 => Self::Chair,
            0x07 => Self::Bed,
            0x08 => Self::Door,
            0x09 => Self::Shoe,
            0x0A => Self::Generic,
            _ => Self::Unknown,
        }
    }

    /// Display text reported to hosts.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dog => "Dog",
            Self::Car => "Car",
            Self::Fridge => "Fridge",
            Self::Bag => "Bag",
            Self::Bike => "Bike",
            Self::Chair => "Chair",
            Self::Bed => "Bed",
            Self::Door => "Door",
            Self::Shoe => "Shoe",
            Self::Generic => "Generic",
            Self::Unknown => "Unknown",
        }
    }
}

/// An Estimote nearable sticker.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Nearable {
    /// 8-byte identifier rendered as hex.
    pub identifier: String,
    /// Sticker type.
    pub nearable_type: NearableType,
    /// Sticker colour.
    pub color: String,
    /// Firmware version.
    pub firmware_version: String,
}

/// Settings block of a connected device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceSettings {
    /// Advertising interval in milliseconds.
    pub advertising_interval_millis: u32,
    /// Battery level (0-100).
    pub battery_level: u8,
    /// Broadcasting power in dBm.
    pub broadcasting_power: i8,
    /// Firmware version.
    pub firmware: String,
    /// Hardware revision.
    pub hardware: String,
}

/// Snapshot of a connected, authorized device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    /// Battery charge in percent.
    pub battery_percentage: u8,
    /// Enclosure colour.
    pub color: String,
    /// Bluetooth address.
    pub mac: MacAddress,
    /// Advertised major.
    pub major: u16,
    /// Advertised minor.
    pub minor: u16,
    /// Cloud-assigned name.
    pub name: String,
    /// Advertised proximity UUID.
    pub uuid: Uuid,
    /// Device settings.
    pub settings: DeviceSettings,
}

/// How a host identifies the device it wants to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDescriptor {
    /// By Bluetooth address.
    ByMac(MacAddress),
    /// By advertised identity.
    ByTriple {
        /// Proximity UUID.
        uuid: Uuid,
        /// Major.
        major: u16,
        /// Minor.
        minor: u16,
    },
}

impl DeviceDescriptor {
    /// Build a descriptor from loosely-typed host fields.
    ///
    /// A non-empty MAC wins. Otherwise all of UUID, major and minor must be
    /// present and in range; anything else yields `None`.
    ///
    /// # Examples
    ///
    /// ```
    /// use beacon_types::DeviceDescriptor;
    ///
    /// let by_mac = DeviceDescriptor::from_fields(Some("AA:BB:CC:DD:EE:FF"), None, None, None);
    /// assert!(matches!(by_mac, Ok(Some(DeviceDescriptor::ByMac(_)))));
    ///
    /// let partial = DeviceDescriptor::from_fields(None, None, Some(1), Some(2));
    /// assert!(matches!(partial, Ok(None)));
    /// ```
    pub fn from_fields(
        mac: Option<&str>,
        uuid: Option<&str>,
        major: Option<i64>,
        minor: Option<i64>,
    ) -> ParseResult<Option<Self>> {
        if let Some(mac) = mac.filter(|m| !m.trim().is_empty()) {
            return Ok(Some(Self::ByMac(mac.parse()?)));
        }
        let uuid = match uuid.filter(|u| !u.trim().is_empty()) {
            Some(u) => parse_proximity_uuid(u)?,
            None => return Ok(None),
        };
        let in_range = |v: Option<i64>| v.and_then(|v| u16::try_from(v).ok());
        match (in_range(major), in_range(minor)) {
            (Some(major), Some(minor)) => Ok(Some(Self::ByTriple { uuid, major, minor })),
            _ => Ok(None),
        }
    }

    /// The MAC address, when the descriptor is address-based.
    #[must_use]
    pub fn mac(&self) -> Option<MacAddress> {
        match self {
            Self::ByMac(mac) => Some(*mac),
            Self::ByTriple { .. } => None,
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByMac(mac) => write!(f, "{mac}"),
            Self::ByTriple { uuid, major, minor } => {
                write!(f, "{}:{major}:{minor}", format_uuid(uuid))
            }
        }
    }
}
