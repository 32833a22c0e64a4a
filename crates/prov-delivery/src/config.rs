//! Delivery configuration
//!
//! Serial flashing, serial connector selection and OTA batch settings.

use serde::{Deserialize, Serialize};

/// Serial flashing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Link speed used for flashing
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Flash attempts per device, each on a freshly opened session
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Timeout for a single read in milliseconds
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,

    /// Timeout for the device's verification answer in milliseconds
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_ms: u64,

    /// Pause before reopening the session after a failed attempt
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Connector used to reach serial endpoints
    #[serde(default)]
    pub connector: ConnectorConfig,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            max_attempts: default_max_attempts(),
            io_timeout_ms: default_io_timeout(),
            verify_timeout_ms: default_verify_timeout(),
            retry_delay_ms: default_retry_delay(),
            connector: ConnectorConfig::default(),
        }
    }
}

fn default_baud_rate() -> u32 {
    460_800
}

fn default_max_attempts() -> u32 {
    3
}

fn default_io_timeout() -> u64 {
    2_000
}

fn default_verify_timeout() -> u64 {
    30_000
}

fn default_retry_delay() -> u64 {
    500
}

// =============================================================================
// Connector Configuration
// =============================================================================

/// Serial connector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectorConfig {
    /// Serial endpoints exposed by a TCP serial bridge (`host:port`)
    Tcp(TcpBridgeConfig),
    /// Simulated devices for testing
    Mock(MockConnectorConfig),
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self::Tcp(TcpBridgeConfig::default())
    }
}

/// TCP serial bridge configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TcpBridgeConfig {
    /// Bridge endpoints scanned for attached devices
    #[serde(default)]
    pub ports: Vec<String>,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout() -> u64 {
    2_000
}

/// Mock connector configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MockConnectorConfig {
    /// Ports with a simulated device attached
    #[serde(default)]
    pub ports: Vec<String>,
}

// =============================================================================
// OTA Configuration
// =============================================================================

/// One upload step of an OTA delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaPart {
    /// Image region whose payload is uploaded
    pub region: String,
    /// Device endpoint path the payload is posted to
    pub path: String,
}

/// OTA batch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtaConfig {
    /// Targets served concurrently
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Deadline for one target's complete delivery in milliseconds
    #[serde(default = "default_target_timeout")]
    pub target_timeout_ms: u64,

    /// Connect timeout per request in milliseconds
    #[serde(default = "default_ota_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// URL scheme of the device web server
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Port of the device web server
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upload steps in order; the application must come last since it
    /// reboots the device
    #[serde(default = "default_parts")]
    pub parts: Vec<OtaPart>,

    /// Pause between the parts of one target in milliseconds
    #[serde(default = "default_part_delay")]
    pub part_delay_ms: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            target_timeout_ms: default_target_timeout(),
            connect_timeout_ms: default_ota_connect_timeout(),
            scheme: default_scheme(),
            port: default_port(),
            parts: default_parts(),
            part_delay_ms: default_part_delay(),
        }
    }
}

fn default_max_in_flight() -> usize {
    8
}

fn default_target_timeout() -> u64 {
    120_000
}

fn default_ota_connect_timeout() -> u64 {
    3_000
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_port() -> u16 {
    80
}

fn default_parts() -> Vec<OtaPart> {
    vec![
        OtaPart {
            region: "www".to_string(),
            path: "update/www".to_string(),
        },
        OtaPart {
            region: "app".to_string(),
            path: "update/firmware".to_string(),
        },
    ]
}

fn default_part_delay() -> u64 {
    1_000
}
