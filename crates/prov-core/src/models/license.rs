//! License issued by the remote authority

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use super::credentials::ActivationKey;
use crate::error::ProvisionError;

/// Kind of license requested from the authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseType {
    /// Full activation, billed once per activation key
    #[default]
    Activated,
    /// Time limited trial license
    Trial,
}

/// Opaque signed license blob, bound to an activation key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct License {
    key: ActivationKey,
    blob: Vec<u8>,
}

impl License {
    /// Wrap a blob issued for `key`
    pub fn new(key: ActivationKey, blob: Vec<u8>) -> Result<Self, ProvisionError> {
        if blob.is_empty() {
            return Err(ProvisionError::validation(format!(
                "empty license blob for key {}",
                key
            )));
        }
        Ok(Self { key, blob })
    }

    /// Decode a base64 blob issued for `key`
    pub fn from_base64(key: ActivationKey, encoded: &str) -> Result<Self, ProvisionError> {
        let blob = BASE64
            .decode(encoded.trim())
            .map_err(|e| ProvisionError::validation(format!("license is not valid base64: {}", e)))?;
        Self::new(key, blob)
    }

    /// Activation key this license was issued for
    pub fn key(&self) -> &ActivationKey {
        &self.key
    }

    /// Raw license bytes
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Base64 form used in settings files and on the wire
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.blob)
    }
}
