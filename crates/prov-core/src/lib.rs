//! prov-core - Core types and seams for device provisioning
//!
//! This crate holds the domain model (device identity, credentials,
//! licenses, flash targets), the shared error taxonomy, the transport
//! traits implemented by the delivery crate, and activation key
//! derivation.

pub mod activation;
pub mod error;
pub mod models;
pub mod provider;
pub mod transport;

pub use activation::derive;
pub use error::{
    DeliveryErrorKind, LicenseErrorKind, PartitionErrorKind, ProvisionError, ProvisionResult,
};
pub use models::*;
pub use provider::LicenseProvider;
pub use transport::{IdentityResolver, OtaTransport, SerialConnector, SerialLink, TransportError};
