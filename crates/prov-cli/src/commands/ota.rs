//! OTA command - update a batch of network targets

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use prov_core::{ChipVariant, TargetSet};
use prov_delivery::{HttpOtaTransport, OtaDriver};
use prov_image::compose_with_fill;
use prov_image::partition::release_folder;
use prov_pipeline::{load_settings, partition_map, ProvisionConfig};

use crate::output::{OtaRow, OutputContext};

/// Build the release image of `chip` and deliver it to every target
///
/// Devices keep their own settings and license; only the firmware regions
/// of the image are uploaded.
pub async fn ota(
    config: &ProvisionConfig,
    targets: &TargetSet,
    chip: &str,
    ctx: &OutputContext,
) -> Result<()> {
    let chip: ChipVariant = chip
        .parse()
        .with_context(|| format!("Unknown chip '{}'", chip))?;

    let settings = load_settings(&config.settings).context("Failed to load settings")?;
    let map = partition_map(&config.image, chip).context("Failed to load partition map")?;
    let firmware = map
        .load_payloads(release_folder(&config.image.release_dir, chip))
        .context("Failed to load release binaries")?;
    let image = compose_with_fill(&map, &firmware, &settings, None, config.image.fill)
        .context("Failed to compose image")?;

    let transport =
        HttpOtaTransport::new(&config.ota).context("Failed to create OTA transport")?;
    let driver = OtaDriver::new(Arc::new(transport), config.ota.clone());

    ctx.info(&format!(
        "Updating {} target(s), {} at a time...",
        targets.len(),
        config.ota.max_in_flight
    ));
    let report = driver.deliver(&image, targets.addresses()).await?;

    let rows: Vec<OtaRow> = report
        .results
        .iter()
        .map(|r| OtaRow {
            target: r.address.to_string(),
            outcome: r.outcome.to_string(),
        })
        .collect();
    ctx.print(&rows);

    let failed = report.failed().count();
    if failed > 0 {
        bail!("{} of {} target(s) failed", failed, report.results.len());
    }
    ctx.success(&format!("All {} target(s) updated", report.results.len()));
    Ok(())
}
