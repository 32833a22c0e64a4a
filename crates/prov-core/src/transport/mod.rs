//! Transport seams for serial and network delivery
//!
//! Only the primitives the provisioning stages need are modelled here:
//! - serial sessions (open, write, read, close)
//! - OTA uploads to an IP-addressed device
//! - identity read-back from a serial-attached device
//!
//! Concrete implementations live in the delivery crate.

mod adapter;
pub mod error;

pub use adapter::{IdentityResolver, OtaTransport, SerialConnector, SerialLink};
pub use error::TransportError;
