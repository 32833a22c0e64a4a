//! Device identity and chip variant models

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

/// Length of a device identity in bytes (factory-programmed base MAC)
pub const DEVICE_IDENTITY_LEN: usize = 6;

/// Stable unique identifier of a physical device
///
/// Read once from the device and never modified afterwards.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity([u8; DEVICE_IDENTITY_LEN]);

impl DeviceIdentity {
    /// Create an identity from its raw bytes
    pub const fn new(bytes: [u8; DEVICE_IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create an identity from a slice, failing on the wrong length
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProvisionError> {
        let raw: [u8; DEVICE_IDENTITY_LEN] = bytes.try_into().map_err(|_| {
            ProvisionError::validation(format!(
                "device identity must be {} bytes, got {}",
                DEVICE_IDENTITY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    /// Raw identity bytes
    pub fn as_bytes(&self) -> &[u8; DEVICE_IDENTITY_LEN] {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        f.write_str(&parts.join(":"))
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceIdentity({})", self)
    }
}

/// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF` and `AABBCCDDEEFF`
impl FromStr for DeviceIdentity {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        let bytes = hex::decode(&compact)
            .map_err(|e| ProvisionError::validation(format!("invalid device identity '{}': {}", s, e)))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for DeviceIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceIdentity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Chip variants the firmware is released for
///
/// The numeric value is the chip id reported by the ROM bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChipVariant {
    Esp32,
    Esp32S2,
    Esp32C3,
    Esp32S3,
    Esp32C6,
    Esp32C5,
}

impl ChipVariant {
    /// Every supported variant
    pub const ALL: [ChipVariant; 6] = [
        ChipVariant::Esp32,
        ChipVariant::Esp32S2,
        ChipVariant::Esp32C3,
        ChipVariant::Esp32S3,
        ChipVariant::Esp32C6,
        ChipVariant::Esp32C5,
    ];

    /// Look up a variant by its ROM chip id
    pub fn from_chip_id(chip_id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.chip_id() == chip_id)
    }

    /// ROM chip id of this variant
    pub fn chip_id(&self) -> u16 {
        match self {
            ChipVariant::Esp32 => 0,
            ChipVariant::Esp32S2 => 2,
            ChipVariant::Esp32C3 => 5,
            ChipVariant::Esp32S3 => 9,
            ChipVariant::Esp32C6 => 13,
            ChipVariant::Esp32C5 => 23,
        }
    }

    /// Lowercase chip name, e.g. `esp32c5`
    pub fn name(&self) -> &'static str {
        match self {
            ChipVariant::Esp32 => "esp32",
            ChipVariant::Esp32S2 => "esp32s2",
            ChipVariant::Esp32C3 => "esp32c3",
            ChipVariant::Esp32S3 => "esp32s3",
            ChipVariant::Esp32C6 => "esp32c6",
            ChipVariant::Esp32C5 => "esp32c5",
        }
    }

    /// Folder holding this variant's binaries inside a release
    pub fn release_folder(&self) -> String {
        format!("{}_generic", self.name())
    }
}

impl fmt::Display for ChipVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChipVariant {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect();
        Self::ALL
            .into_iter()
            .find(|v| v.name() == normalized)
            .ok_or_else(|| ProvisionError::validation(format!("unknown chip variant '{}'", s)))
    }
}
