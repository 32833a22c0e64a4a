//! Per-device provisioning pipeline
//!
//! ```text
//! serial port
//!     │
//!     ▼
//! ┌──────────┐   ┌─────┐   ┌─────────┐   ┌──────────┐   ┌───────┐   ┌──────────┐
//! │ Identity │──▶│ Key │──▶│ License │──▶│ Settings │──▶│ Image │──▶│ Delivery │
//! └──────────┘   └─────┘   └─────────┘   └──────────┘   └───────┘   └──────────┘
//! ```
//!
//! Stages run strictly in order. Identity, license and delivery cross an
//! I/O boundary through injected collaborators; key derivation, settings
//! preparation and image composition are pure functions of their inputs.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use prov_core::{
    derive, AccountToken, ActivationKey, ChipVariant, DeviceIdentity, IdentityResolver, License,
    LicenseErrorKind, LicenseProvider, ProvisionError, ProvisionResult, ResolvedDevice,
};
use prov_delivery::{SerialFlashReport, SerialFlasher};
use prov_image::partition::release_folder;
use prov_image::sequencer::{assign, next_run};
use prov_image::{
    compose_with_fill, embed_license, merge, PartitionImage, PartitionMap, SettingsRecord,
};
use prov_license::LicenseStore;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::config::{ImageSection, ProvisionConfig, SettingsSection};

/// Pipeline stage names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Identity,
    Key,
    License,
    Settings,
    Image,
    Delivery,
    /// Writing the sequenced values back after a successful flash
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Identity => "identity",
            Stage::Key => "key",
            Stage::License => "license",
            Stage::Settings => "settings",
            Stage::Image => "image",
            Stage::Delivery => "delivery",
            Stage::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// A stage failure with the device context needed to diagnose it
#[derive(Debug, Error)]
#[error("{stage} stage failed on {port} (device {}): {source}", identity_label(.identity))]
pub struct PipelineError {
    pub port: String,
    pub identity: Option<DeviceIdentity>,
    pub stage: Stage,
    #[source]
    pub source: ProvisionError,
}

fn identity_label(identity: &Option<DeviceIdentity>) -> String {
    identity
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Where the license of a run came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseSource {
    Authority,
    LocalStore,
    Device,
}

impl fmt::Display for LicenseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LicenseSource::Authority => f.write_str("authority"),
            LicenseSource::LocalStore => f.write_str("local store"),
            LicenseSource::Device => f.write_str("device"),
        }
    }
}

/// Result of provisioning one device
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub port: String,
    pub identity: DeviceIdentity,
    pub chip: ChipVariant,
    pub activation_key: ActivationKey,
    pub license_source: LicenseSource,
    /// Station address written to the device, empty for DHCP
    pub ip_sta: Option<String>,
    pub image_sha256: String,
    pub flash: SerialFlashReport,
}

/// Settings prepared for one device
#[derive(Debug, Clone)]
pub struct PreparedSettings {
    /// Merged and sequenced settings without the license
    pub base: SettingsRecord,
    /// What goes onto the device
    pub device: SettingsRecord,
}

/// Load the operator settings and merge them into the release settings
pub fn load_settings(settings: &SettingsSection) -> ProvisionResult<SettingsRecord> {
    let user = SettingsRecord::load(&settings.path)?;
    match &settings.release_path {
        Some(release) => Ok(merge(&SettingsRecord::load(release)?, &user)),
        None => Ok(user),
    }
}

/// Sequence and license a settings record
///
/// With `index` the sequenced fields are assigned from it, otherwise they
/// advance by one relative to `record`, starting no lower than the configured
/// start index. Sequencing is skipped when disabled.
pub fn prepare_settings(
    record: &SettingsRecord,
    config: &ProvisionConfig,
    index: Option<u32>,
    license: &License,
) -> ProvisionResult<PreparedSettings> {
    let sequencer = &config.sequencer;
    let base = if !sequencer.enabled {
        record.clone()
    } else {
        match index {
            Some(index) => assign(record, &sequencer.fields, index)?,
            None => next_run(record, &sequencer.fields, sequencer.start_index)?,
        }
    };
    let mut device = base.clone();
    embed_license(
        &mut device,
        license,
        &config.settings.license_key,
        &config.settings.namespace,
    )?;
    Ok(PreparedSettings { base, device })
}

/// Partition map for `chip` from the configured YAML maps or the release
pub fn partition_map(image: &ImageSection, chip: ChipVariant) -> ProvisionResult<PartitionMap> {
    match &image.partition_map {
        Some(path) => PartitionMap::load_for_chip(path, chip),
        None => PartitionMap::from_release(
            &image.release_dir,
            chip,
            image.settings_offset,
            image.settings_size,
        ),
    }
}

/// Compose the flash image of `chip` from the release
pub fn build_image(
    image: &ImageSection,
    chip: ChipVariant,
    settings: &SettingsRecord,
    license: &License,
) -> ProvisionResult<PartitionImage> {
    let map = partition_map(image, chip)?;
    let firmware = map.load_payloads(release_folder(&image.release_dir, chip))?;
    compose_with_fill(&map, &firmware, settings, Some(license), image.fill)
}

/// Write the sequenced values back into the operator settings file so the
/// next run continues from them
fn persist_sequence(config: &ProvisionConfig, base: &SettingsRecord) -> ProvisionResult<()> {
    let path: &Path = &config.settings.path;
    let mut user = SettingsRecord::load(path)?;
    for field in &config.sequencer.fields {
        if let Some(value) = base.get(&field.name) {
            let kind = base.field(&field.name, "type").unwrap_or("data").to_string();
            let encoding = base.field(&field.name, "encoding").unwrap_or("string").to_string();
            user.upsert(&field.name, &kind, &encoding, value);
        }
    }
    user.save(path)
}

/// Runs the pipeline for devices on serial ports
#[derive(Clone)]
pub struct Provisioner {
    config: ProvisionConfig,
    token: AccountToken,
    resolver: Arc<dyn IdentityResolver>,
    licenses: Arc<dyn LicenseProvider>,
    store: Option<LicenseStore>,
    flasher: SerialFlasher,
}

impl Provisioner {
    pub fn new(
        config: ProvisionConfig,
        token: AccountToken,
        resolver: Arc<dyn IdentityResolver>,
        licenses: Arc<dyn LicenseProvider>,
        flasher: SerialFlasher,
    ) -> Self {
        let store = config.license.client.storage_dir.clone().map(LicenseStore::new);
        Self {
            config,
            token,
            resolver,
            licenses,
            store,
            flasher,
        }
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Provision the device on `port`
    ///
    /// `index` assigns the sequenced parameters explicitly; without it they
    /// advance from the stored settings, which are updated afterwards. A
    /// failed update is a [`Stage::Persist`] error even though the device was
    /// flashed, since the next run would reuse its values.
    #[instrument(skip(self))]
    pub async fn provision(&self, port: &str, index: Option<u32>) -> Result<ProvisionReport, PipelineError> {
        let fail = |stage: Stage, identity: Option<DeviceIdentity>| {
            move |source: ProvisionError| PipelineError {
                port: port.to_string(),
                identity,
                stage,
                source,
            }
        };

        let ResolvedDevice { identity, chip } = self
            .resolver
            .resolve(port)
            .await
            .map_err(fail(Stage::Identity, None))?;
        let id = Some(identity);

        let key = derive(&identity, &self.token);
        info!(%identity, %chip, %key, "Activation key derived");

        let (license, license_source) = self
            .obtain_license(port, &key)
            .await
            .map_err(fail(Stage::License, id))?;

        let record = load_settings(&self.config.settings).map_err(fail(Stage::Settings, id))?;
        let prepared = prepare_settings(&record, &self.config, index, &license)
            .map_err(fail(Stage::Settings, id))?;

        let image = build_image(&self.config.image, chip, &prepared.device, &license)
            .map_err(fail(Stage::Image, id))?;
        info!(len = image.len(), base = image.base_offset(), "Image composed");

        let flash = self
            .flasher
            .flash(&image, port)
            .await
            .map_err(fail(Stage::Delivery, id))?;

        if self.config.sequencer.enabled && index.is_none() {
            if let Err(e) = persist_sequence(&self.config, &prepared.base) {
                error!(%identity, %e, "Device flashed but sequenced settings were not stored");
                return Err(fail(Stage::Persist, id)(e));
            }
        }

        let ip_sta = prepared.base.get("ip_sta").map(str::to_string);
        info!(
            %identity,
            ip = ip_sta.as_deref().unwrap_or("-"),
            source = %license_source,
            "Device provisioned"
        );
        Ok(ProvisionReport {
            port: port.to_string(),
            identity,
            chip,
            activation_key: key,
            license_source,
            ip_sta,
            image_sha256: hex::encode(image.sha256()),
            flash,
        })
    }

    /// Get the license for `key`, falling back to stored copies when the
    /// authority cannot be reached
    ///
    /// Without any license the device is left untouched, since flashing
    /// would erase its activation.
    async fn obtain_license(
        &self,
        port: &str,
        key: &ActivationKey,
    ) -> ProvisionResult<(License, LicenseSource)> {
        let offline_reason = if self.licenses.is_available().await {
            match self.licenses.request_license(key).await {
                Ok(license) => return Ok((license, LicenseSource::Authority)),
                Err(ProvisionError::LicenseServer {
                    kind: LicenseErrorKind::TransientExhausted,
                    message,
                }) => message,
                Err(e) => return Err(e),
            }
        } else {
            "license authority is not reachable".to_string()
        };
        warn!(reason = %offline_reason, "Using stored license");

        if let Some(store) = &self.store {
            if let Some(license) = store.load(key)? {
                return Ok((license, LicenseSource::LocalStore));
            }
        }

        if let Some(blob) = self.resolver.read_installed_license(port).await? {
            let license = License::new(*key, blob)?;
            if let Some(store) = &self.store {
                store.save(&license)?;
            }
            return Ok((license, LicenseSource::Device));
        }

        Err(ProvisionError::license(
            LicenseErrorKind::TransientExhausted,
            format!(
                "{}; no stored or installed license for key {}",
                offline_reason, key
            ),
        ))
    }
}
