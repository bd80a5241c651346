//! Device identifiers and type tags for attached modules

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UidError {
    #[error("Empty uid")]
    Empty,
    #[error("Invalid base58 character {0:?} in uid")]
    InvalidCharacter(char),
    #[error("Uid {0} does not fit into 64 bits")]
    Overflow(String),
}

/// Unique identifier of a module, as reported by enumeration
///
/// The broker transmits uids as base58 strings inside enumeration payloads and
/// as little-endian `u32` values inside frame headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub String);

impl Uid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    /// Create a uid from the numeric value carried in frame headers
    pub fn from_wire(value: u32) -> Self {
        Self(base58::encode(u64::from(value)))
    }

    /// Numeric value used to address this module in frame headers
    pub fn to_wire(&self) -> Result<u32, UidError> {
        let value = base58::decode(&self.0)?;
        if let Ok(short) = u32::try_from(value) {
            return Ok(short);
        }

        // 64-bit uids are folded into 32 bits the same way the broker does
        let value1 = (value & 0xFFFF_FFFF) as u32;
        let value2 = ((value >> 32) & 0xFFFF_FFFF) as u32;
        Ok((value1 & 0x0000_0FFF)
            | ((value1 & 0x0F00_0000) >> 12)
            | ((value2 & 0x0000_003F) << 16)
            | ((value2 & 0x000F_0000) << 6)
            | ((value2 & 0x3F00_0000) << 2))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Top-level modules report "0" as their parent
    pub fn is_root_marker(&self) -> bool {
        self.0.is_empty() || self.0 == "0"
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Uid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Uid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Capability class of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Sensor,
    Display,
    Unknown,
}

/// Device type tag reported by enumeration (the module's device identifier)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceType(pub u16);

impl DeviceType {
    /// Air Quality Bricklet: IAQ index, temperature, humidity, air pressure
    pub const AIR_QUALITY: Self = Self(297);
    /// LCD 128x64 Bricklet
    pub const LCD_128X64: Self = Self(298);

    /// Human-readable name for known types
    pub fn name(&self) -> Option<&'static str> {
        match *self {
            Self::AIR_QUALITY => Some("Air Quality Bricklet"),
            Self::LCD_128X64 => Some("LCD 128x64 Bricklet"),
            _ => None,
        }
    }

    pub fn class(&self) -> DeviceClass {
        match *self {
            Self::AIR_QUALITY => DeviceClass::Sensor,
            Self::LCD_128X64 => DeviceClass::Display,
            _ => DeviceClass::Unknown,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "device type {}", self.0),
        }
    }
}

/// Hardware or firmware version triple
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version(pub [u8; 3]);

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

mod base58 {
    use super::UidError;

    const ALPHABET: &[u8; 58] = b"123456789abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ";

    pub fn encode(mut value: u64) -> String {
        let mut digits = Vec::new();
        loop {
            digits.push(ALPHABET[(value % 58) as usize]);
            value /= 58;
            if value == 0 {
                break;
            }
        }
        digits.iter().rev().map(|&b| b as char).collect()
    }

    pub fn decode(encoded: &str) -> Result<u64, UidError> {
        if encoded.is_empty() {
            return Err(UidError::Empty);
        }

        let mut value: u64 = 0;
        for c in encoded.chars() {
            let index = ALPHABET
                .iter()
                .position(|&b| b as char == c)
                .ok_or(UidError::InvalidCharacter(c))?;
            value = value
                .checked_mul(58)
                .and_then(|v| v.checked_add(index as u64))
                .ok_or_else(|| UidError::Overflow(encoded.to_string()))?;
        }
        Ok(value)
    }
}
