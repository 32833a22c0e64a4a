//! Key command - activation key derivation

use anyhow::{Context, Result};
use prov_core::{derive, AccountToken, DeviceIdentity};

use crate::output::OutputContext;

/// Derive the activation key of a device
pub fn key(identity: &str, token: &AccountToken, ctx: &OutputContext) -> Result<()> {
    let identity: DeviceIdentity = identity
        .parse()
        .with_context(|| format!("Invalid device identity '{}'", identity))?;
    let key = derive(&identity, token);

    ctx.print_kv(&[
        ("Device", identity.to_string()),
        ("Account", token.redacted()),
        ("Activation key", key.to_hex()),
    ]);
    Ok(())
}
