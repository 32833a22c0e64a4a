//! Image commands - offline composition and release checks

use std::path::Path;

use anyhow::{Context, Result};
use prov_core::{derive, AccountToken, ChipVariant, DeviceIdentity, License};
use prov_image::{PartitionImage, RegionContent};
use prov_license::LicenseStore;
use prov_pipeline::{build_image, load_settings, prepare_settings, ProvisionConfig};

use crate::output::{OutputContext, RegionRow};

/// Compose the flash image of one device without flashing it
///
/// The license comes from `license_file` (raw blob) or from the local
/// license store.
#[allow(clippy::too_many_arguments)]
pub fn compose(
    config: &ProvisionConfig,
    token: &AccountToken,
    identity: &str,
    chip: &str,
    license_file: Option<&Path>,
    index: Option<u32>,
    out: &Path,
    ctx: &OutputContext,
) -> Result<()> {
    let identity: DeviceIdentity = identity
        .parse()
        .with_context(|| format!("Invalid device identity '{}'", identity))?;
    let chip: ChipVariant = chip
        .parse()
        .with_context(|| format!("Unknown chip '{}'", chip))?;
    let key = derive(&identity, token);

    let license = match license_file {
        Some(path) => {
            let blob = std::fs::read(path)
                .with_context(|| format!("Failed to read license file: {}", path.display()))?;
            License::new(key, blob)?
        }
        None => {
            let dir = config
                .license
                .client
                .storage_dir
                .clone()
                .context("No license file given and no license storage configured")?;
            LicenseStore::new(dir)
                .load(&key)?
                .with_context(|| format!("No stored license for activation key {}", key))?
        }
    };

    let record = load_settings(&config.settings).context("Failed to load settings")?;
    let prepared = prepare_settings(&record, config, index, &license)
        .context("Failed to prepare settings")?;
    let image = build_image(&config.image, chip, &prepared.device, &license)
        .context("Failed to compose image")?;

    std::fs::write(out, image.bytes())
        .with_context(|| format!("Failed to write image: {}", out.display()))?;

    ctx.print(&region_rows(&image));
    ctx.success(&format!(
        "Wrote {} bytes at 0x{:x} to {} (sha256 {})",
        image.len(),
        image.base_offset(),
        out.display(),
        hex::encode(image.sha256())
    ));
    Ok(())
}

/// Verify the release holds every binary the chip's layout lists
pub fn check_release(release_dir: &Path, chip: &str, ctx: &OutputContext) -> Result<()> {
    let chip: ChipVariant = chip
        .parse()
        .with_context(|| format!("Unknown chip '{}'", chip))?;
    let map = prov_image::check_release(release_dir, chip)
        .with_context(|| format!("Release for {} is incomplete", chip))?;

    let mut regions: Vec<_> = map.regions.iter().collect();
    regions.sort_by_key(|r| r.offset);
    let rows: Vec<RegionRow> = regions
        .into_iter()
        .map(|r| RegionRow {
            region: r.name.clone(),
            content: content_name(r.content).to_string(),
            offset: format!("0x{:x}", r.offset),
            used: 0,
            capacity: r.size,
        })
        .collect();
    ctx.print(&rows);
    ctx.success(&format!("Release for {} is complete", chip));
    Ok(())
}

pub(crate) fn region_rows(image: &PartitionImage) -> Vec<RegionRow> {
    image
        .placements()
        .iter()
        .map(|p| RegionRow {
            region: p.region.clone(),
            content: content_name(p.content).to_string(),
            offset: format!("0x{:x}", p.offset),
            used: p.len,
            capacity: p.capacity,
        })
        .collect()
}

fn content_name(content: RegionContent) -> &'static str {
    match content {
        RegionContent::Firmware => "firmware",
        RegionContent::Settings => "settings",
        RegionContent::License => "license",
    }
}
