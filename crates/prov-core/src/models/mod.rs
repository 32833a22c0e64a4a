//! Domain models shared by the provisioning crates

mod credentials;
mod identity;
mod license;
mod target;

pub use credentials::{AccountToken, ActivationKey, ACTIVATION_KEY_LEN, MIN_TOKEN_LEN};
pub use identity::{ChipVariant, DeviceIdentity, DEVICE_IDENTITY_LEN};
pub use license::{License, LicenseType};
pub use target::{FlashTarget, TargetSet, MAX_RANGE_TARGETS};

/// A device as seen on a serial endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub identity: DeviceIdentity,
    pub chip: ChipVariant,
}
