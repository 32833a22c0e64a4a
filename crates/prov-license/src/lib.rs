//! prov-license - License authority client
//!
//! Exchanges activation keys for signed licenses. The client treats an
//! "already issued" answer as success, retries rate limiting and transient
//! network failures with exponential backoff, keeps at most one request in
//! flight per activation key, and optionally stores every issued license
//! locally for offline re-provisioning.
//!
//! # Example
//!
//! ```ignore
//! use prov_license::{LicenseClient, LicenseClientConfig};
//!
//! let config = LicenseClientConfig::builder("https://licenses.example.net").build();
//! let client = LicenseClient::new(config, token)?;
//! let license = client.request_license(&key).await?;
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod store;
pub mod types;

pub use backoff::ExponentialBackoff;
pub use client::LicenseClient;
pub use config::{LicenseClientConfig, LicenseClientConfigBuilder, RetryConfig};
pub use store::LicenseStore;
pub use types::{ErrorResponse, LicenseRequest, LicenseResponse};
