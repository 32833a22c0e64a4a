//! prov-delivery - Getting composed images onto devices
//!
//! - [`SerialFlasher`] writes an image over a serial session and retries
//!   until the device confirms the checksum
//! - [`OtaDriver`] pushes image parts to many IP-addressed devices at once
//! - [`SerialIdentityResolver`] reads a device's identity and installed license
//! - [`DeviceApiClient`] talks to the settings web API of a running device
//!
//! Serial endpoints are reached through a [`prov_core::SerialConnector`]:
//! a TCP serial bridge in production or simulated devices in tests.

pub mod config;
pub mod driver;
pub mod http;
pub mod identity;
pub mod lease;
pub mod mock;
pub mod ota;
pub mod protocol;
pub mod serial;
pub mod tcp;

pub use config::{ConnectorConfig, MockConnectorConfig, OtaConfig, OtaPart, SerialConfig, TcpBridgeConfig};
pub use driver::{create_connector, DeliveryDriver, DeliveryReceipt};
pub use http::{DeviceApiClient, HttpOtaTransport};
pub use identity::SerialIdentityResolver;
pub use lease::{PortLease, PortLeases};
pub use mock::{FlashedImage, MockDevice, MockOtaTransport, MockSerialConnector, OtaBehavior};
pub use ota::{OtaDriver, OtaReport, TargetOutcome, TargetResult};
pub use serial::{SerialFlashReport, SerialFlasher};
pub use tcp::TcpSerialConnector;
