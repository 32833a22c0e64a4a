//! Wire types exchanged with the license authority

use prov_core::LicenseType;
use serde::{Deserialize, Serialize};

/// Body of a license issuance request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicenseRequest {
    /// Activation key as lowercase hex
    pub activation_key: String,
    pub license_type: LicenseType,
    /// 0 means the license never expires
    pub validity_days: u32,
}

/// Successful issuance, or the existing license for an already issued key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicenseResponse {
    /// Signed license blob, base64
    pub license: String,
    /// True when the key already had a license and no credit was used
    #[serde(default)]
    pub already_issued: bool,
}

/// Structured error body returned by the authority
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine readable error code, e.g. `already_issued`, `quota_exceeded`
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: Option<String>,
    /// Present when `error` is `already_issued`
    #[serde(default)]
    pub license: Option<String>,
}

impl ErrorResponse {
    pub const ALREADY_ISSUED: &'static str = "already_issued";

    /// Human readable description
    pub fn describe(&self) -> String {
        match &self.message {
            Some(m) if !self.error.is_empty() => format!("{}: {}", self.error, m),
            Some(m) => m.clone(),
            None => self.error.clone(),
        }
    }
}
