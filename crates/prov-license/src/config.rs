//! License client configuration

use std::path::PathBuf;

use prov_core::LicenseType;
use serde::{Deserialize, Serialize};

/// License client configuration
///
/// Read as the `[license]` table of a run configuration, or built with
/// [`LicenseClientConfig::builder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicenseClientConfig {
    /// Base URL of the license authority
    pub base_url: String,

    /// Kind of license to request
    #[serde(default)]
    pub license_type: LicenseType,

    /// Validity in days, 0 means the license never expires
    #[serde(default)]
    pub validity_days: u32,

    /// Endpoint paths
    #[serde(default)]
    pub endpoints: EndpointsConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Retry policy for rate limiting and transient network failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Directory holding issued licenses as `<activation-key>.lic`
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
}

/// Endpoint paths on the authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// License issuance: POST
    #[serde(default = "default_licenses_path")]
    pub licenses: String,

    /// Availability probe: GET
    #[serde(default = "default_health_path")]
    pub health: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            licenses: default_licenses_path(),
            health: default_health_path(),
        }
    }
}

fn default_licenses_path() -> String {
    "/api/v1/licenses".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// Timeout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Request timeout in milliseconds (default: 30s)
    #[serde(default = "default_request_timeout")]
    pub request_ms: u64,

    /// Connect timeout in milliseconds (default: 10s)
    #[serde(default = "default_connect_timeout")]
    pub connect_ms: u64,

    /// Availability probe timeout in milliseconds (default: 3s)
    #[serde(default = "default_probe_timeout")]
    pub probe_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            request_ms: default_request_timeout(),
            connect_ms: default_connect_timeout(),
            probe_ms: default_probe_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_connect_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_probe_timeout() -> u64 {
    3_000
}

/// Retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound on any single delay in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Growth factor between consecutive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_retries() -> u32 {
    4
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    8_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl LicenseClientConfig {
    /// Create a builder for programmatic configuration
    pub fn builder(base_url: impl Into<String>) -> LicenseClientConfigBuilder {
        LicenseClientConfigBuilder::new(base_url)
    }
}

/// Builder for LicenseClientConfig
pub struct LicenseClientConfigBuilder {
    config: LicenseClientConfig,
}

impl LicenseClientConfigBuilder {
    /// Create a new builder with the given base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: LicenseClientConfig {
                base_url: base_url.into(),
                license_type: LicenseType::default(),
                validity_days: 0,
                endpoints: EndpointsConfig::default(),
                timeouts: TimeoutsConfig::default(),
                retry: RetryConfig::default(),
                storage_dir: None,
            },
        }
    }

    /// Set the retry budget and delays
    pub fn retry(mut self, max_retries: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        self.config.retry.max_retries = max_retries;
        self.config.retry.initial_backoff_ms = initial_backoff_ms;
        self.config.retry.max_backoff_ms = max_backoff_ms;
        self
    }

    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage_dir = Some(dir.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> LicenseClientConfig {
        self.config
    }
}
