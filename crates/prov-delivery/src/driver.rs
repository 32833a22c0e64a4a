//! Single entry point for delivering an image to any flash target

use std::sync::Arc;

use prov_core::{FlashTarget, ProvisionResult, SerialConnector, TransportError};
use prov_image::PartitionImage;
use tracing::info;

use crate::config::{ConnectorConfig, SerialConfig};
use crate::mock::MockSerialConnector;
use crate::ota::OtaDriver;
use crate::serial::SerialFlasher;
use crate::tcp::TcpSerialConnector;

/// Create a serial connector from configuration
pub fn create_connector(config: &SerialConfig) -> Result<Arc<dyn SerialConnector>, TransportError> {
    match &config.connector {
        ConnectorConfig::Tcp(cfg) => Ok(Arc::new(TcpSerialConnector::new(cfg))),
        ConnectorConfig::Mock(cfg) => Ok(Arc::new(MockSerialConnector::from_config(cfg))),
    }
}

/// How a flash ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReceipt {
    Serial { port: String, attempts: u32 },
    Network { address: std::net::IpAddr },
}

/// Routes images to serial or network delivery by target kind
#[derive(Clone)]
pub struct DeliveryDriver {
    serial: SerialFlasher,
    ota: OtaDriver,
}

impl DeliveryDriver {
    pub fn new(serial: SerialFlasher, ota: OtaDriver) -> Self {
        Self { serial, ota }
    }

    pub fn serial(&self) -> &SerialFlasher {
        &self.serial
    }

    pub fn ota(&self) -> &OtaDriver {
        &self.ota
    }

    /// Deliver `image` to `target`
    ///
    /// Serial targets fail with `serial-exhausted` or `port-busy`; network
    /// targets fail with `network-target-failed`.
    pub async fn flash(&self, image: &PartitionImage, target: &FlashTarget) -> ProvisionResult<DeliveryReceipt> {
        match target {
            FlashTarget::Serial { port } => {
                let report = self.serial.flash(image, port).await?;
                Ok(DeliveryReceipt::Serial {
                    port: report.port,
                    attempts: report.attempts,
                })
            }
            FlashTarget::Network { address } => {
                self.ota.deliver_to(image, *address).await?;
                info!(%address, "Network target updated");
                Ok(DeliveryReceipt::Network { address: *address })
            }
        }
    }
}
