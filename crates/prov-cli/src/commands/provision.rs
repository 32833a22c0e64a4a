//! Provisioning commands - serial ports, identity, single runs and watch mode

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use prov_core::{IdentityResolver, SerialConnector};
use prov_pipeline::{FleetWatcher, ProvisionReport, Provisioner, WatchConfig};

use crate::output::{OutputContext, PortRow, ProvisionRow};

/// List attached serial endpoints
pub async fn ports(connector: &dyn SerialConnector, ctx: &OutputContext) -> Result<()> {
    let ports = connector
        .list_ports()
        .await
        .context("Failed to list serial ports")?;
    let rows: Vec<PortRow> = ports.into_iter().map(|port| PortRow { port }).collect();
    ctx.print(&rows);
    Ok(())
}

/// Read identity and installed license of the device on `port`
pub async fn identify(resolver: &dyn IdentityResolver, port: &str, ctx: &OutputContext) -> Result<()> {
    let device = resolver
        .resolve(port)
        .await
        .with_context(|| format!("Failed to identify device on {}", port))?;
    let installed = resolver
        .read_installed_license(port)
        .await
        .with_context(|| format!("Failed to read license from {}", port))?;

    ctx.print_kv(&[
        ("Port", port.to_string()),
        ("Device", device.identity.to_string()),
        ("Chip", device.chip.to_string()),
        (
            "Installed license",
            match installed {
                Some(blob) => format!("{} bytes", blob.len()),
                None => "none".to_string(),
            },
        ),
    ]);
    Ok(())
}

/// Provision the device on `port`
pub async fn provision(
    provisioner: &Provisioner,
    port: &str,
    index: Option<u32>,
    ctx: &OutputContext,
) -> Result<()> {
    let pb = if ctx.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message(format!("Provisioning {}...", port));

    let result = provisioner.provision(port, index).await;
    pb.finish_and_clear();

    let report = result?;
    ctx.print(&[provision_row(&report)]);
    ctx.success(&format!(
        "Provisioned {} on {} (image sha256 {})",
        report.identity, report.port, report.image_sha256
    ));
    Ok(())
}

/// Provision devices as they are plugged in, until Ctrl+C
pub async fn watch(
    provisioner: Provisioner,
    connector: Arc<dyn SerialConnector>,
    config: WatchConfig,
    ctx: &OutputContext,
) -> Result<()> {
    ctx.info("Watching for devices, press Ctrl+C to stop");
    let mut watcher = FleetWatcher::new(provisioner, connector, config);
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let summary = watcher.run(shutdown).await;

    ctx.print_kv(&[
        ("Provisioned", summary.provisioned.to_string()),
        ("Failed", summary.failed.to_string()),
    ]);
    if summary.halted {
        bail!("Watch stopped: sequenced settings could not be stored");
    }
    Ok(())
}

fn provision_row(report: &ProvisionReport) -> ProvisionRow {
    ProvisionRow {
        port: report.port.clone(),
        identity: report.identity.to_string(),
        chip: report.chip.to_string(),
        ip: match report.ip_sta.as_deref() {
            Some("") | None => "DHCP".to_string(),
            Some(ip) => ip.to_string(),
        },
        license: report.license_source.to_string(),
        attempts: report.flash.attempts,
    }
}
