//! Temporary provisioning bench
//!
//! Lays out a release for ESP32-C5, an operator settings file and a license
//! store in a temporary folder, and wires a provisioner against a mock
//! serial connector and a real license client.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use prov_core::{AccountToken, ChipVariant, DeviceIdentity, ProvisionResult};
use prov_delivery::{MockSerialConnector, SerialFlasher, SerialIdentityResolver};
use prov_image::partition::{release_folder, FLASH_ARGS_FILE};
use prov_image::{codec, SettingsRecord, DEFAULT_SETTINGS_OFFSET, DEFAULT_SETTINGS_SIZE};
use prov_license::{LicenseClient, LicenseStore};
use prov_pipeline::{ConfigError, ProvisionConfig, Provisioner};
use tempfile::TempDir;

pub const TOKEN: &str = "bench-token-0123456789";

pub const USER_SETTINGS: &str = "\
key,type,encoding,value
# station settings
settings,namespace,,
ip_sta,data,string,192.168.50.10
wifi_hostname,data,string,drone10
ssid_ap,data,string,DroneBridge10
";

pub const RELEASE_SETTINGS: &str = "\
key,type,encoding,value
settings,namespace,,
wifi_pass,data,string,dronebridge
ip_sta,data,string,
wifi_hostname,data,string,drone
ssid_ap,data,string,DroneBridge
baud,u32,u32,115200
";

/// Identity of bench device `n`
pub fn identity(n: u8) -> DeviceIdentity {
    DeviceIdentity::new([0x24, 0x0A, 0xC4, 0x00, 0x10, n])
}

pub struct Bench {
    dir: TempDir,
    pub connector: MockSerialConnector,
}

impl Bench {
    pub fn new() -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        write_release(dir.path())?;
        std::fs::write(dir.path().join("release_settings.csv"), RELEASE_SETTINGS)?;
        std::fs::write(dir.path().join("user_settings.csv"), USER_SETTINGS)?;
        Ok(Self {
            dir,
            connector: MockSerialConnector::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.path().join("user_settings.csv")
    }

    pub fn store(&self) -> LicenseStore {
        LicenseStore::new(self.dir.path().join("licenses"))
    }

    /// Run configuration against the authority at `base_url`
    ///
    /// `sequencer` is the body of the `[sequencer]` table.
    pub fn config(&self, base_url: &str, sequencer: &str) -> Result<ProvisionConfig, ConfigError> {
        let root = self.dir.path().display().to_string().replace('\\', "/");
        ProvisionConfig::from_toml(&format!(
            r#"
[license]
base_url = "{base_url}"
token = "{TOKEN}"
storage_dir = "{root}/licenses"

[license.timeouts]
request_ms = 2000
connect_ms = 500
probe_ms = 500

[license.retry]
max_retries = 2
initial_backoff_ms = 5
max_backoff_ms = 20

[settings]
path = "{root}/user_settings.csv"
release_path = "{root}/release_settings.csv"

[sequencer]
{sequencer}

[image]
release_dir = "{root}/release"

[serial]
max_attempts = 3
retry_delay_ms = 0

[serial.connector]
type = "mock"

[ota]
part_delay_ms = 0
"#
        ))
    }

    /// Provisioner using a real license client and the bench connector
    pub fn provisioner(&self, config: &ProvisionConfig) -> ProvisionResult<Provisioner> {
        let token = AccountToken::new(TOKEN)?;
        let connector = Arc::new(self.connector.clone());
        let licenses = Arc::new(LicenseClient::new(config.license.client.clone(), token.clone())?);
        Ok(Provisioner::new(
            config.clone(),
            token,
            Arc::new(SerialIdentityResolver::new(connector.clone(), &config.serial)),
            licenses,
            SerialFlasher::new(connector, config.serial.clone()),
        ))
    }

    /// Settings the device on `port` received in its last flash
    pub fn flashed_settings(&self, port: &str) -> ProvisionResult<Option<SettingsRecord>> {
        let Some(image) = self.connector.flashed(port).pop() else {
            return Ok(None);
        };
        let start = (DEFAULT_SETTINGS_OFFSET - image.base_offset) as usize;
        let end = start + DEFAULT_SETTINGS_SIZE as usize;
        codec::decode(&image.data[start..end]).map(Some)
    }
}

fn write_release(dir: &Path) -> std::io::Result<()> {
    let folder = release_folder(&dir.join("release"), ChipVariant::Esp32C5);
    std::fs::create_dir_all(&folder)?;
    std::fs::write(
        folder.join(FLASH_ARGS_FILE),
        "--flash_mode dio --flash_freq 80m --flash_size 4MB\n\
         0x0 bootloader/bootloader.bin\n\
         0x8000 partition_table/partition-table.bin\n\
         0xf000 ota_data_initial.bin\n\
         0x20000 db_esp32c5.bin\n\
         0x200000 www.bin\n",
    )?;
    std::fs::write(folder.join("bootloader.bin"), vec![0xB0; 0x4000])?;
    std::fs::write(folder.join("partition-table.bin"), vec![0xAA; 0xC00])?;
    std::fs::write(folder.join("ota_data_initial.bin"), vec![0x0D; 0x2000])?;
    std::fs::write(folder.join("db_esp32c5.bin"), vec![0xA5; 0x18000])?;
    std::fs::write(folder.join("www.bin"), vec![0x57; 0x6000])?;
    Ok(())
}
