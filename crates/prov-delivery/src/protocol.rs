//! Serial provisioning protocol spoken by the device loader
//!
//! Every exchange starts with a one byte command. All integers are little
//! endian.
//!
//! | command | request | response |
//! |---|---|---|
//! | `IDENTIFY` | - | chip id (u16), base MAC (6) |
//! | `READ_LICENSE` | - | length (u32), license bytes |
//! | `FLASH` | base offset (u32), length (u32), SHA-256 (32), image | SHA-256 of received image (32) |

use prov_core::{ChipVariant, DeviceIdentity, ResolvedDevice, TransportError, DEVICE_IDENTITY_LEN};
use sha2::{Digest, Sha256};

pub const CMD_IDENTIFY: u8 = 0x01;
pub const CMD_READ_LICENSE: u8 = 0x02;
pub const CMD_FLASH: u8 = 0x03;

/// Length of the identify response
pub const IDENTIFY_RESPONSE_LEN: usize = 2 + DEVICE_IDENTITY_LEN;
/// Length of the flash header including the command byte
pub const FLASH_HEADER_LEN: usize = 1 + 4 + 4 + 32;
/// Length of the verification response
pub const VERIFY_RESPONSE_LEN: usize = 32;
/// Largest license a device may report
pub const MAX_LICENSE_LEN: usize = 16 * 1024;

/// Header preceding the image bytes of a flash command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashHeader {
    pub base_offset: u32,
    pub length: u32,
    pub sha256: [u8; 32],
}

impl FlashHeader {
    pub fn for_image(base_offset: u32, image: &[u8]) -> Result<Self, TransportError> {
        let length = u32::try_from(image.len())
            .map_err(|_| TransportError::ProtocolError("image larger than 4 GiB".into()))?;
        Ok(Self {
            base_offset,
            length,
            sha256: Sha256::digest(image).into(),
        })
    }

    pub fn to_bytes(&self) -> [u8; FLASH_HEADER_LEN] {
        let mut out = [0u8; FLASH_HEADER_LEN];
        out[0] = CMD_FLASH;
        out[1..5].copy_from_slice(&self.base_offset.to_le_bytes());
        out[5..9].copy_from_slice(&self.length.to_le_bytes());
        out[9..].copy_from_slice(&self.sha256);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < FLASH_HEADER_LEN || data[0] != CMD_FLASH {
            return Err(TransportError::ProtocolError("not a flash header".into()));
        }
        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&data[9..FLASH_HEADER_LEN]);
        Ok(Self {
            base_offset: word(1),
            length: word(5),
            sha256,
        })
    }
}

/// Parse an identify response
pub fn parse_identify(data: &[u8]) -> Result<ResolvedDevice, TransportError> {
    if data.len() != IDENTIFY_RESPONSE_LEN {
        return Err(TransportError::ProtocolError(format!(
            "identify response has {} bytes, expected {}",
            data.len(),
            IDENTIFY_RESPONSE_LEN
        )));
    }
    let chip_id = u16::from_le_bytes([data[0], data[1]]);
    let chip = ChipVariant::from_chip_id(chip_id)
        .ok_or_else(|| TransportError::ProtocolError(format!("unsupported chip id {}", chip_id)))?;
    let identity = DeviceIdentity::from_slice(&data[2..])
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
    Ok(ResolvedDevice { identity, chip })
}

/// Build an identify response
pub fn identify_response(device: &ResolvedDevice) -> Vec<u8> {
    let mut out = Vec::with_capacity(IDENTIFY_RESPONSE_LEN);
    out.extend_from_slice(&device.chip.chip_id().to_le_bytes());
    out.extend_from_slice(device.identity.as_bytes());
    out
}
