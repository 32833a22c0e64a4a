//! Provisioning run configuration
//!
//! One TOML document describes a complete run:
//!
//! ```toml
//! [license]
//! base_url = "https://licenses.example.net"
//! license_type = "activated"
//! storage_dir = "licenses"
//!
//! [settings]
//! path = "db_settings.csv"
//! release_path = "release/db_settings.csv"
//!
//! [sequencer]
//! enabled = true
//!
//! [image]
//! release_dir = "release"
//!
//! [serial.connector]
//! type = "tcp"
//! ports = ["10.0.0.5:3333"]
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use prov_core::{AccountToken, ProvisionError, ProvisionResult};
use prov_delivery::{OtaConfig, SerialConfig};
use prov_image::partition::de_u32;
use prov_image::{
    SequencerConfig, DEFAULT_FILL, DEFAULT_LICENSE_KEY, DEFAULT_NAMESPACE,
    DEFAULT_SETTINGS_OFFSET, DEFAULT_SETTINGS_SIZE,
};
use prov_license::LicenseClientConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable holding the account token
pub const TOKEN_ENV: &str = "PROV_TOKEN";

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Complete configuration of a provisioning run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    pub license: LicenseSection,
    pub settings: SettingsSection,
    #[serde(default)]
    pub sequencer: SequencerConfig,
    pub image: ImageSection,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub ota: OtaConfig,
}

impl ProvisionConfig {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_toml(&content)
    }
}

/// License authority settings plus the account token
#[derive(Clone, Serialize, Deserialize)]
pub struct LicenseSection {
    /// Account token; falls back to `PROV_TOKEN`
    #[serde(default, skip_serializing)]
    pub token: Option<String>,

    #[serde(flatten)]
    pub client: LicenseClientConfig,
}

impl fmt::Debug for LicenseSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LicenseSection")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("client", &self.client)
            .finish()
    }
}

impl LicenseSection {
    /// Resolve the account token from the file or the environment
    pub fn account_token(&self) -> ProvisionResult<AccountToken> {
        let raw = match &self.token {
            Some(token) => token.clone(),
            None => std::env::var(TOKEN_ENV).map_err(|_| {
                ProvisionError::validation(format!(
                    "no account token configured and {} is not set",
                    TOKEN_ENV
                ))
            })?,
        };
        AccountToken::new(raw.trim())
    }
}

/// Settings files and license embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsSection {
    /// Operator settings file
    pub path: PathBuf,

    /// Release settings file the operator settings are merged into
    #[serde(default)]
    pub release_path: Option<PathBuf>,

    /// Row the license is embedded under
    #[serde(default = "default_license_key")]
    pub license_key: String,

    /// Namespace row the device loader requires
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_license_key() -> String {
    DEFAULT_LICENSE_KEY.to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Firmware release and image layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSection {
    /// Folder holding one `<chip>_generic` folder per chip variant
    pub release_dir: PathBuf,

    /// YAML partition maps keyed by chip; without it the layout is read from
    /// the release's `flash_args.txt`
    #[serde(default)]
    pub partition_map: Option<PathBuf>,

    #[serde(default = "default_settings_offset", deserialize_with = "de_u32")]
    pub settings_offset: u32,

    #[serde(default = "default_settings_size", deserialize_with = "de_u32")]
    pub settings_size: u32,

    /// Byte unused flash is filled with
    #[serde(default = "default_fill")]
    pub fill: u8,
}

fn default_settings_offset() -> u32 {
    DEFAULT_SETTINGS_OFFSET
}

fn default_settings_size() -> u32 {
    DEFAULT_SETTINGS_SIZE
}

fn default_fill() -> u8 {
    DEFAULT_FILL
}

#[cfg(test)]
mod tests {
    use super::*;
    use prov_core::LicenseType;
    use prov_delivery::ConnectorConfig;
    use prov_image::FieldKind;

    const CONFIG: &str = r#"
[license]
base_url = "https://licenses.example.net"
token = "abcd1234efgh5678"
license_type = "trial"
validity_days = 30
storage_dir = "licenses"

[license.retry]
max_retries = 2

[settings]
path = "db_settings.csv"
release_path = "release/db_settings.csv"

[sequencer]
enabled = true
start_index = 10
fields = [{ name = "ip_sta", kind = "ipv4-last-octet" }]

[image]
release_dir = "release"
settings_offset = "0xA000"

[serial]
max_attempts = 5

[serial.connector]
type = "mock"
ports = ["mock0"]

[ota]
max_in_flight = 4
"#;

    #[test]
    fn test_full_config() {
        let config = ProvisionConfig::from_toml(CONFIG).unwrap();
        assert_eq!(config.license.client.base_url, "https://licenses.example.net");
        assert_eq!(config.license.client.license_type, LicenseType::Trial);
        assert_eq!(config.license.client.validity_days, 30);
        assert_eq!(config.license.client.retry.max_retries, 2);
        assert_eq!(config.license.client.retry.initial_backoff_ms, 500);
        assert_eq!(
            config.license.account_token().unwrap().expose(),
            "abcd1234efgh5678"
        );

        assert_eq!(config.settings.license_key, "dlse_lic");
        assert_eq!(config.settings.namespace, "settings");
        assert!(config.sequencer.enabled);
        assert_eq!(config.sequencer.start_index, Some(10));
        assert_eq!(config.sequencer.fields[0].kind, FieldKind::Ipv4LastOctet);

        assert_eq!(config.image.settings_offset, 0xA000);
        assert_eq!(config.image.settings_size, DEFAULT_SETTINGS_SIZE);
        assert_eq!(config.image.fill, 0xFF);

        assert_eq!(config.serial.max_attempts, 5);
        assert_eq!(config.serial.baud_rate, 460_800);
        assert!(matches!(config.serial.connector, ConnectorConfig::Mock(_)));
        assert_eq!(config.ota.max_in_flight, 4);
        assert_eq!(config.ota.parts.len(), 2);
    }

    #[test]
    fn test_token_is_redacted_in_debug() {
        let config = ProvisionConfig::from_toml(CONFIG).unwrap();
        let text = format!("{:?}", config);
        assert!(!text.contains("abcd1234efgh5678"));
        assert!(text.contains("<redacted>"));
    }

    #[test]
    fn test_missing_section_is_parse_error() {
        let err = ProvisionConfig::from_toml("[license]\nbase_url = \"x\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
