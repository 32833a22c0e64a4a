//! Serial delivery
//!
//! Each attempt opens a fresh session, sends the flash header and the image,
//! and waits for the device to answer with the SHA-256 of what it received.
//! A mismatch or I/O error triggers another attempt until the budget is
//! spent. The whole retry loop runs on its own task so dropping the caller
//! never interrupts a write in progress.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prov_core::{
    DeliveryErrorKind, ProvisionError, ProvisionResult, SerialConnector, SerialLink,
    TransportError,
};
use prov_image::PartitionImage;
use tracing::{debug, info, instrument, warn};

use crate::config::SerialConfig;
use crate::lease::{PortLease, PortLeases};
use crate::protocol::{FlashHeader, VERIFY_RESPONSE_LEN};

/// Result of a successful serial flash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFlashReport {
    pub port: String,
    pub attempts: u32,
    pub bytes_written: usize,
    pub sha256: String,
}

/// Flashes composed images over serial sessions
#[derive(Clone)]
pub struct SerialFlasher {
    connector: Arc<dyn SerialConnector>,
    leases: PortLeases,
    config: SerialConfig,
}

impl SerialFlasher {
    pub fn new(connector: Arc<dyn SerialConnector>, config: SerialConfig) -> Self {
        Self {
            connector,
            leases: PortLeases::new(),
            config,
        }
    }

    /// Share a lease registry with other users of the same endpoints
    pub fn with_leases(mut self, leases: PortLeases) -> Self {
        self.leases = leases;
        self
    }

    pub fn leases(&self) -> &PortLeases {
        &self.leases
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Flash `image` to the device on `port`
    ///
    /// Success means the device confirmed the checksum of the complete image.
    #[instrument(skip(self, image), fields(len = image.len()))]
    pub async fn flash(&self, image: &PartitionImage, port: &str) -> ProvisionResult<SerialFlashReport> {
        let lease = self.leases.acquire(port)?;
        let flasher = self.clone();
        let data = image.bytes();
        let base = image.base_offset();

        // Detached so cancellation of the caller does not cut a write short
        let task = tokio::spawn(async move { flasher.flash_leased(lease, base, data).await });
        task.await.map_err(|e| {
            ProvisionError::delivery(
                DeliveryErrorKind::SerialExhausted,
                port,
                format!("flash task failed: {}", e),
            )
        })?
    }

    async fn flash_leased(
        &self,
        lease: PortLease,
        base: u32,
        data: Bytes,
    ) -> ProvisionResult<SerialFlashReport> {
        let port = lease.port().to_string();
        let header = FlashHeader::for_image(base, &data)
            .map_err(|e| ProvisionError::delivery(DeliveryErrorKind::SerialExhausted, &port, e.to_string()))?;
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = TransportError::ConnectionFailed("No attempt".into());

        for attempt in 1..=max_attempts {
            match self.attempt(&port, &header, &data).await {
                Ok(()) => {
                    info!(%port, attempt, bytes = data.len(), "Image flashed and verified");
                    return Ok(SerialFlashReport {
                        port,
                        attempts: attempt,
                        bytes_written: data.len(),
                        sha256: hex::encode(header.sha256),
                    });
                }
                Err(e) => {
                    warn!(%port, attempt, max_attempts, %e, "Flash attempt failed");
                    last_error = e;
                    if attempt < max_attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                    }
                }
            }
        }

        Err(ProvisionError::delivery(
            DeliveryErrorKind::SerialExhausted,
            port,
            format!("{} attempts failed, last error: {}", max_attempts, last_error),
        ))
    }

    /// One attempt on a freshly opened session; the session is closed on
    /// every path
    async fn attempt(
        &self,
        port: &str,
        header: &FlashHeader,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut link = self.connector.open(port, self.config.baud_rate).await?;
        let result = self.write_and_verify(link.as_mut(), header, data).await;
        if let Err(e) = link.close().await {
            debug!(%port, %e, "Closing serial session failed");
        }
        result
    }

    async fn write_and_verify(
        &self,
        link: &mut dyn SerialLink,
        header: &FlashHeader,
        data: &[u8],
    ) -> Result<(), TransportError> {
        link.write_all(&header.to_bytes()).await?;
        link.write_all(data).await?;
        let answer = link
            .read_exact(
                VERIFY_RESPONSE_LEN,
                Duration::from_millis(self.config.verify_timeout_ms),
            )
            .await?;
        if answer.as_slice() != header.sha256 {
            return Err(TransportError::ProtocolError(format!(
                "checksum mismatch: device reported {}",
                hex::encode(&answer)
            )));
        }
        Ok(())
    }
}
