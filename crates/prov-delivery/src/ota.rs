//! OTA batch delivery
//!
//! Every target receives the configured parts of the image in order. Targets
//! run concurrently up to `max_in_flight`, each under its own deadline, and
//! one target's failure never affects the others.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use prov_core::{
    DeliveryErrorKind, OtaTransport, PartitionErrorKind, ProvisionError, ProvisionResult,
    TransportError,
};
use prov_image::PartitionImage;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::config::OtaConfig;

/// Outcome of delivering to one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum TargetOutcome {
    Success,
    /// The target did not finish within its deadline
    Timeout,
    /// The target answered with a non-success status
    Rejected { part: String, status: u16 },
    /// The target could not be reached
    Unreachable { part: String, reason: String },
}

impl TargetOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TargetOutcome::Success)
    }
}

impl fmt::Display for TargetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetOutcome::Success => f.write_str("success"),
            TargetOutcome::Timeout => f.write_str("timeout"),
            TargetOutcome::Rejected { part, status } => {
                write!(f, "rejected {} with HTTP {}", part, status)
            }
            TargetOutcome::Unreachable { part, reason } => {
                write!(f, "unreachable during {}: {}", part, reason)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetResult {
    pub address: IpAddr,
    #[serde(flatten)]
    pub outcome: TargetOutcome,
}

/// Per-target outcomes of a batch, in target order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OtaReport {
    pub results: Vec<TargetResult>,
}

impl OtaReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &TargetResult> {
        self.results.iter().filter(|r| r.outcome.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TargetResult> {
        self.results.iter().filter(|r| !r.outcome.is_success())
    }

    pub fn outcome(&self, address: IpAddr) -> Option<&TargetOutcome> {
        self.results
            .iter()
            .find(|r| r.address == address)
            .map(|r| &r.outcome)
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_success())
    }
}

/// Delivers image parts to IP-addressed devices
#[derive(Clone)]
pub struct OtaDriver {
    transport: Arc<dyn OtaTransport>,
    config: OtaConfig,
}

impl OtaDriver {
    pub fn new(transport: Arc<dyn OtaTransport>, config: OtaConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    /// Upload steps for `image`, in delivery order
    fn parts(&self, image: &PartitionImage) -> ProvisionResult<Vec<(String, String, Bytes)>> {
        if self.config.parts.is_empty() {
            return Err(ProvisionError::validation("no OTA parts configured"));
        }
        self.config
            .parts
            .iter()
            .map(|part| {
                let payload = image.payload(&part.region).ok_or_else(|| {
                    ProvisionError::partition(
                        PartitionErrorKind::MissingPayload,
                        part.region.as_str(),
                        "image has no such region for OTA delivery",
                    )
                })?;
                Ok((part.region.clone(), part.path.clone(), payload))
            })
            .collect()
    }

    /// Deliver `image` to every target and report each outcome
    ///
    /// Fails only when the image lacks a configured part; target failures
    /// are reported per target.
    #[instrument(skip(self, image, targets), fields(targets = targets.len()))]
    pub async fn deliver(&self, image: &PartitionImage, targets: &[IpAddr]) -> ProvisionResult<OtaReport> {
        let parts = Arc::new(self.parts(image)?);
        let deadline = Duration::from_millis(self.config.target_timeout_ms);
        let part_delay = Duration::from_millis(self.config.part_delay_ms);
        let max_in_flight = self.config.max_in_flight.max(1);

        let mut results: Vec<(usize, TargetResult)> = stream::iter(targets.iter().copied().enumerate())
            .map(|(idx, address)| {
                let transport = self.transport.clone();
                let parts = parts.clone();
                async move {
                    let outcome = match tokio::time::timeout(
                        deadline,
                        deliver_one(transport.as_ref(), address, &parts, part_delay),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => TargetOutcome::Timeout,
                    };
                    match &outcome {
                        TargetOutcome::Success => info!(%address, "OTA update delivered"),
                        other => error!(%address, outcome = %other, "OTA update failed"),
                    }
                    (idx, TargetResult { address, outcome })
                }
            })
            .buffer_unordered(max_in_flight)
            .collect()
            .await;

        results.sort_by_key(|(idx, _)| *idx);
        let report = OtaReport {
            results: results.into_iter().map(|(_, r)| r).collect(),
        };
        info!(
            succeeded = report.succeeded().count(),
            failed = report.failed().count(),
            "OTA batch finished"
        );
        Ok(report)
    }

    /// Deliver to a single target, failing unless it succeeds
    pub async fn deliver_to(&self, image: &PartitionImage, address: IpAddr) -> ProvisionResult<()> {
        let report = self.deliver(image, &[address]).await?;
        match report.outcome(address) {
            Some(TargetOutcome::Success) => Ok(()),
            Some(other) => Err(ProvisionError::delivery(
                DeliveryErrorKind::NetworkTargetFailed,
                address.to_string(),
                other.to_string(),
            )),
            None => Err(ProvisionError::delivery(
                DeliveryErrorKind::NetworkTargetFailed,
                address.to_string(),
                "no outcome recorded",
            )),
        }
    }
}

async fn deliver_one(
    transport: &dyn OtaTransport,
    address: IpAddr,
    parts: &[(String, String, Bytes)],
    part_delay: Duration,
) -> TargetOutcome {
    for (idx, (region, path, payload)) in parts.iter().enumerate() {
        if idx > 0 && !part_delay.is_zero() {
            tokio::time::sleep(part_delay).await;
        }
        match transport.upload(address, path, payload.clone()).await {
            Ok(status) if (200..300).contains(&status) => {}
            Ok(status) => {
                return TargetOutcome::Rejected {
                    part: region.clone(),
                    status,
                }
            }
            Err(TransportError::Timeout(_)) => return TargetOutcome::Timeout,
            Err(e) => {
                if !e.is_unreachable() {
                    warn!(%address, %e, "Upload failed");
                }
                return TargetOutcome::Unreachable {
                    part: region.clone(),
                    reason: e.to_string(),
                };
            }
        }
    }
    TargetOutcome::Success
}
