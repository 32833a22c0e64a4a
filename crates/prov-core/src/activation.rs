//! Activation key derivation
//!
//! The key is SHA-256 over the raw device identity followed by the token
//! bytes. The identity has a fixed length so the concatenation is
//! unambiguous.

use sha2::{Digest, Sha256};

use crate::models::{AccountToken, ActivationKey, DeviceIdentity};

/// Derive the activation key for a device and account
pub fn derive(identity: &DeviceIdentity, token: &AccountToken) -> ActivationKey {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(token.expose().as_bytes());
    ActivationKey::from_bytes(hasher.finalize().into())
}

/// Derive from unvalidated operator input
///
/// Fails with a validation error when either input is malformed.
pub fn derive_from_str(
    identity: &str,
    token: &str,
) -> Result<ActivationKey, crate::error::ProvisionError> {
    let identity: DeviceIdentity = identity.parse()?;
    let token = AccountToken::new(token)?;
    Ok(derive(&identity, &token))
}
