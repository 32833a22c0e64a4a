//! Account token and activation key

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

/// Minimum accepted account token length
pub const MIN_TOKEN_LEN: usize = 8;

/// Length of an activation key in bytes (SHA-256 digest)
pub const ACTIVATION_KEY_LEN: usize = 32;

/// Operator-supplied secret used to authenticate with the license authority
///
/// Never persisted and never printed in full.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountToken(String);

impl AccountToken {
    /// Validate and wrap a token
    ///
    /// Tokens are printable ASCII without whitespace and at least
    /// [`MIN_TOKEN_LEN`] characters long.
    pub fn new(token: impl Into<String>) -> Result<Self, ProvisionError> {
        let token = token.into();
        if token.len() < MIN_TOKEN_LEN {
            return Err(ProvisionError::validation(format!(
                "account token must be at least {} characters",
                MIN_TOKEN_LEN
            )));
        }
        if !token.chars().all(|c| c.is_ascii_graphic()) {
            return Err(ProvisionError::validation(
                "account token must be printable ASCII without whitespace",
            ));
        }
        Ok(Self(token))
    }

    /// The secret itself, for the derivation input and the auth header only
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Redacted form showing the first and last four characters
    pub fn redacted(&self) -> String {
        let n = self.0.len();
        if n <= 8 {
            return "****".to_string();
        }
        format!("{}…{}", &self.0[..4], &self.0[n - 4..])
    }
}

impl fmt::Debug for AccountToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountToken({})", self.redacted())
    }
}

/// Deterministic fingerprint of a device + account pair
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivationKey([u8; ACTIVATION_KEY_LEN]);

impl ActivationKey {
    /// Wrap raw key bytes
    pub const fn from_bytes(bytes: [u8; ACTIVATION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; ACTIVATION_KEY_LEN] {
        &self.0
    }

    /// Lowercase hex form, as sent to the authority and used for file names
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ActivationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ActivationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActivationKey({})", self.to_hex())
    }
}

impl FromStr for ActivationKey {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| ProvisionError::validation(format!("invalid activation key: {}", e)))?;
        let raw: [u8; ACTIVATION_KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            ProvisionError::validation(format!(
                "activation key must be {} bytes, got {}",
                ACTIVATION_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }
}

impl Serialize for ActivationKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ActivationKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_validation() {
        assert!(AccountToken::new("short").is_err());
        assert!(AccountToken::new("has a space in it").is_err());
        assert!(AccountToken::new("abcd1234efgh5678").is_ok());
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = AccountToken::new("abcd1234efgh5678").unwrap();
        let debug = format!("{:?}", token);
        assert!(!debug.contains("1234efgh"));
        assert!(debug.contains("abcd"));
        assert!(debug.contains("5678"));
    }

    #[test]
    fn test_key_hex_parse() {
        let key = ActivationKey::from_bytes([0xAB; ACTIVATION_KEY_LEN]);
        let parsed: ActivationKey = key.to_hex().parse().unwrap();
        assert_eq!(parsed, key);
        assert!("abcd".parse::<ActivationKey>().is_err());
    }
}
