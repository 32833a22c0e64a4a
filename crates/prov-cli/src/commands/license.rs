//! License commands - authority requests and availability

use anyhow::{bail, Context, Result};
use prov_core::{derive, ActivationKey, AccountToken, DeviceIdentity};
use prov_license::LicenseClient;

use crate::output::OutputContext;

/// Request the license of a device from the authority
///
/// The device is given either by identity or directly by activation key.
pub async fn license_request(
    client: &LicenseClient,
    token: &AccountToken,
    identity: Option<&str>,
    key: Option<&str>,
    ctx: &OutputContext,
) -> Result<()> {
    let key: ActivationKey = match (identity, key) {
        (_, Some(key)) => key
            .parse()
            .with_context(|| format!("Invalid activation key '{}'", key))?,
        (Some(identity), None) => {
            let identity: DeviceIdentity = identity
                .parse()
                .with_context(|| format!("Invalid device identity '{}'", identity))?;
            derive(&identity, token)
        }
        (None, None) => bail!("Either a device identity or an activation key is required"),
    };

    ctx.info(&format!("Requesting license for {}...", key));
    let license = client
        .request_license(&key)
        .await
        .context("License request failed")?;

    let mut pairs = vec![
        ("Activation key", key.to_hex()),
        ("License", license.to_base64()),
    ];
    if let Some(store) = client.store() {
        pairs.push(("Stored at", store.path_for(&key).display().to_string()));
    }
    ctx.print_kv(&pairs);
    Ok(())
}

/// Probe the license authority
pub async fn license_check(client: &LicenseClient, ctx: &OutputContext) -> Result<()> {
    let url = client.config().base_url.clone();
    if client.is_available().await {
        ctx.success(&format!("License authority at {} is reachable", url));
        Ok(())
    } else {
        bail!("License authority at {} is not reachable", url)
    }
}
