//! Device identity and installed license read-back over serial

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prov_core::{
    DeliveryErrorKind, IdentityResolver, ProvisionError, ProvisionResult, ResolvedDevice, SerialConnector, SerialLink,
    TransportError,
};
use tracing::{debug, info, instrument};

use crate::config::SerialConfig;
use crate::protocol::{
    parse_identify, CMD_IDENTIFY, CMD_READ_LICENSE, IDENTIFY_RESPONSE_LEN, MAX_LICENSE_LEN,
};

/// Resolves devices through the loader's identify command
#[derive(Clone)]
pub struct SerialIdentityResolver {
    connector: Arc<dyn SerialConnector>,
    baud_rate: u32,
    io_timeout: Duration,
}

impl SerialIdentityResolver {
    pub fn new(connector: Arc<dyn SerialConnector>, config: &SerialConfig) -> Self {
        Self {
            connector,
            baud_rate: config.baud_rate,
            io_timeout: Duration::from_millis(config.io_timeout_ms),
        }
    }

    async fn open(&self, port: &str) -> ProvisionResult<Box<dyn SerialLink>> {
        self.connector
            .open(port, self.baud_rate)
            .await
            .map_err(|e| unreadable(port, e))
    }

    async fn close(port: &str, mut link: Box<dyn SerialLink>) {
        if let Err(e) = link.close().await {
            debug!(%port, %e, "Closing serial session failed");
        }
    }
}

/// Malformed answers are invalid data; anything else is a link fault
fn unreadable(port: &str, e: TransportError) -> ProvisionError {
    let message = format!("cannot read device on {}: {}", port, e);
    match e {
        TransportError::ProtocolError(_) => ProvisionError::validation(message),
        TransportError::PortBusy(_) => {
            ProvisionError::delivery(DeliveryErrorKind::PortBusy, port, message)
        }
        _ => ProvisionError::delivery(DeliveryErrorKind::DeviceUnreachable, port, message),
    }
}

async fn identify(link: &mut dyn SerialLink, timeout: Duration) -> Result<ResolvedDevice, TransportError> {
    link.write_all(&[CMD_IDENTIFY]).await?;
    let answer = link.read_exact(IDENTIFY_RESPONSE_LEN, timeout).await?;
    parse_identify(&answer)
}

async fn read_license(link: &mut dyn SerialLink, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
    link.write_all(&[CMD_READ_LICENSE]).await?;
    let header = link.read_exact(4, timeout).await?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_LICENSE_LEN {
        return Err(TransportError::ProtocolError(format!(
            "device reported a {} byte license",
            len
        )));
    }
    Ok(Some(link.read_exact(len, timeout).await?))
}

#[async_trait]
impl IdentityResolver for SerialIdentityResolver {
    #[instrument(skip(self))]
    async fn resolve(&self, port: &str) -> ProvisionResult<ResolvedDevice> {
        let mut link = self.open(port).await?;
        let result = identify(link.as_mut(), self.io_timeout).await;
        Self::close(port, link).await;
        let device = result.map_err(|e| unreadable(port, e))?;
        info!(%port, identity = %device.identity, chip = %device.chip, "Device identified");
        Ok(device)
    }

    #[instrument(skip(self))]
    async fn read_installed_license(&self, port: &str) -> ProvisionResult<Option<Vec<u8>>> {
        let mut link = self.open(port).await?;
        let result = read_license(link.as_mut(), self.io_timeout).await;
        Self::close(port, link).await;
        result.map_err(|e| unreadable(port, e))
    }
}
