//! Command implementations for provctl

pub mod device_api;
pub mod image;
pub mod key;
pub mod license;
pub mod ota;
pub mod provision;
pub mod settings;

pub use device_api::{add_udp_client, reset_static_ip, set_static_ip};
pub use image::{check_release, compose};
pub use key::key;
pub use license::{license_check, license_request};
pub use ota::ota;
pub use provision::{identify, ports, provision, watch};
pub use settings::{merge, sequence};

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use prov_core::{AccountToken, SerialConnector};
use prov_delivery::{create_connector, SerialFlasher, SerialIdentityResolver};
use prov_license::LicenseClient;
use prov_pipeline::{ProvisionConfig, Provisioner};

/// Load the run configuration
pub fn load_run_config(path: &Path) -> Result<ProvisionConfig> {
    ProvisionConfig::from_file(path)
        .with_context(|| format!("Failed to load run configuration {}", path.display()))
}

/// Account token from the command line or the run configuration
pub fn account_token(config: &ProvisionConfig, token: Option<&str>) -> Result<AccountToken> {
    match token {
        Some(token) => AccountToken::new(token).context("Invalid account token"),
        None => config
            .license
            .account_token()
            .context("No usable account token"),
    }
}

pub fn license_client(config: &ProvisionConfig, token: AccountToken) -> Result<LicenseClient> {
    LicenseClient::new(config.license.client.clone(), token)
        .context("Failed to create license client")
}

pub fn serial_connector(config: &ProvisionConfig) -> Result<Arc<dyn SerialConnector>> {
    create_connector(&config.serial).context("Failed to create serial connector")
}

/// Wire a provisioner from the run configuration
pub fn provisioner(
    config: &ProvisionConfig,
    token: AccountToken,
) -> Result<(Provisioner, Arc<dyn SerialConnector>)> {
    let connector = serial_connector(config)?;
    let resolver = Arc::new(SerialIdentityResolver::new(connector.clone(), &config.serial));
    let licenses = Arc::new(license_client(config, token.clone())?);
    let flasher = SerialFlasher::new(connector.clone(), config.serial.clone());
    let provisioner = Provisioner::new(config.clone(), token, resolver, licenses, flasher);
    Ok((provisioner, connector))
}
