//! License provider seam

use async_trait::async_trait;

use crate::error::ProvisionResult;
use crate::models::{ActivationKey, License};

/// Source of licenses for activation keys
///
/// Implementations must be safe to call repeatedly for the same key: a key
/// that already has a license yields that license, never an error.
#[async_trait]
pub trait LicenseProvider: Send + Sync {
    /// Obtain the license for `key`
    async fn request_license(&self, key: &ActivationKey) -> ProvisionResult<License>;

    /// Whether the authority can currently be reached
    async fn is_available(&self) -> bool;
}
