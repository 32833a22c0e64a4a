//! Error taxonomy shared by every provisioning stage

use std::fmt;

use thiserror::Error;

/// Result type for provisioning operations
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Errors that can occur while provisioning a device
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Malformed input data (identity, token, settings row, sequenced field)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The license authority could not deliver a license
    #[error("License server error ({kind}): {message}")]
    LicenseServer {
        kind: LicenseErrorKind,
        message: String,
    },

    /// The partition image could not be built
    #[error("Partition build error ({kind}) in region '{region}': {message}")]
    PartitionBuild {
        kind: PartitionErrorKind,
        region: String,
        message: String,
    },

    /// The composed image could not be delivered to a target
    #[error("Delivery error ({kind}) for {target}: {message}")]
    Delivery {
        kind: DeliveryErrorKind,
        target: String,
        message: String,
    },

    /// IO error while reading or writing local files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a license server error of the given kind
    pub fn license(kind: LicenseErrorKind, message: impl Into<String>) -> Self {
        Self::LicenseServer {
            kind,
            message: message.into(),
        }
    }

    /// Create a partition build error naming the offending region
    pub fn partition(
        kind: PartitionErrorKind,
        region: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::PartitionBuild {
            kind,
            region: region.into(),
            message: message.into(),
        }
    }

    /// Create a delivery error for a target
    pub fn delivery(
        kind: DeliveryErrorKind,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Delivery {
            kind,
            target: target.into(),
            message: message.into(),
        }
    }

    /// Short stable name of the error category, used in reports and logs
    pub fn category(&self) -> &'static str {
        match self {
            ProvisionError::Validation(_) => "validation",
            ProvisionError::LicenseServer { .. } => "license-server",
            ProvisionError::PartitionBuild { .. } => "partition-build",
            ProvisionError::Delivery { .. } => "delivery",
            ProvisionError::Io(_) => "io",
        }
    }
}

/// Kind of license server failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseErrorKind {
    /// Rate limiting or network failures persisted past the retry budget
    TransientExhausted,
    /// The account token was rejected
    InvalidToken,
    /// The account has no license credit left
    QuotaExceeded,
    /// The authority rejected the activation key
    MalformedKey,
    /// The authority answered with something this client does not understand
    Protocol,
}

impl fmt::Display for LicenseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransientExhausted => "transient-exhausted",
            Self::InvalidToken => "invalid-token",
            Self::QuotaExceeded => "quota-exceeded",
            Self::MalformedKey => "malformed-key",
            Self::Protocol => "protocol",
        };
        f.write_str(name)
    }
}

/// Kind of partition build failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionErrorKind {
    /// A payload is larger than its region
    RegionOverflow,
    /// The partition map has overlapping or empty regions
    InvalidMap,
    /// A region expects a payload that was not supplied
    MissingPayload,
}

impl fmt::Display for PartitionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RegionOverflow => "region-overflow",
            Self::InvalidMap => "invalid-map",
            Self::MissingPayload => "missing-payload",
        };
        f.write_str(name)
    }
}

/// Kind of delivery failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryErrorKind {
    /// Serial write/verify failed on every attempt
    SerialExhausted,
    /// A network target did not accept the image
    NetworkTargetFailed,
    /// The serial endpoint is already held by another flash operation
    PortBusy,
    /// The device did not answer on its serial endpoint
    DeviceUnreachable,
}

impl fmt::Display for DeliveryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SerialExhausted => "serial-exhausted",
            Self::NetworkTargetFailed => "network-target-failed",
            Self::PortBusy => "port-busy",
            Self::DeviceUnreachable => "device-unreachable",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(
            LicenseErrorKind::TransientExhausted.to_string(),
            "transient-exhausted"
        );
        assert_eq!(PartitionErrorKind::RegionOverflow.to_string(), "region-overflow");
        assert_eq!(PartitionErrorKind::InvalidMap.to_string(), "invalid-map");
        assert_eq!(DeliveryErrorKind::SerialExhausted.to_string(), "serial-exhausted");
    }

    #[test]
    fn test_partition_error_names_region() {
        let err = ProvisionError::partition(PartitionErrorKind::RegionOverflow, "settings", "too big");
        assert!(err.to_string().contains("'settings'"));
        assert!(err.to_string().contains("region-overflow"));
        assert_eq!(err.category(), "partition-build");
    }
}
