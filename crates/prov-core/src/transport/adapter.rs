//! Transport seams consumed by the delivery and identity stages

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::TransportError;
use crate::error::ProvisionResult;
use crate::models::ResolvedDevice;

/// An open byte-stream session to a serial endpoint
///
/// A link is exclusively owned by one operation. Dropping it without
/// calling [`SerialLink::close`] must still release the endpoint.
#[async_trait]
pub trait SerialLink: Send {
    /// Write every byte of `data`
    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `len` bytes, failing if they do not arrive within `timeout`
    async fn read_exact(&mut self, len: usize, timeout: Duration)
        -> Result<Vec<u8>, TransportError>;

    /// Close the session
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens serial sessions by address
#[async_trait]
pub trait SerialConnector: Send + Sync {
    /// Open a session on `port` at `baud_rate`
    async fn open(&self, port: &str, baud_rate: u32)
        -> Result<Box<dyn SerialLink>, TransportError>;

    /// Endpoints currently attached to this host
    async fn list_ports(&self) -> Result<Vec<String>, TransportError>;
}

/// Request/response delivery of a payload to an IP-addressed device
#[async_trait]
pub trait OtaTransport: Send + Sync {
    /// Upload `payload` to `path` on `address`, returning the device's status code
    ///
    /// Timeouts are applied by the caller.
    async fn upload(
        &self,
        address: IpAddr,
        path: &str,
        payload: Bytes,
    ) -> Result<u16, TransportError>;
}

/// Reads identifying data from a device attached to a serial endpoint
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Read the device identity and chip variant
    async fn resolve(&self, port: &str) -> ProvisionResult<ResolvedDevice>;

    /// Read the license currently installed on the device, if any
    async fn read_installed_license(&self, port: &str) -> ProvisionResult<Option<Vec<u8>>>;
}
