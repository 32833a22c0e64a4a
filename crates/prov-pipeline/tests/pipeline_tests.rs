//! Pipeline runs against simulated devices and an in-memory authority

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use prov_core::{
    derive, AccountToken, ActivationKey, ChipVariant, DeviceIdentity, License, LicenseErrorKind,
    LicenseProvider, ProvisionError, ProvisionResult, SerialConnector, SerialLink, TransportError,
};
use prov_delivery::{MockDevice, MockSerialConnector, SerialConfig, SerialFlasher, SerialIdentityResolver};
use prov_image::partition::{release_folder, FLASH_ARGS_FILE};
use prov_image::{codec, SettingsRecord, DEFAULT_SETTINGS_OFFSET};
use prov_license::LicenseStore;
use prov_pipeline::{
    FleetWatcher, LicenseSource, ProvisionConfig, Provisioner, Stage, WatchConfig,
};

const TOKEN: &str = "abcd1234efgh5678";
const PORT: &str = "mock0";

const USER_SETTINGS: &str = "\
key,type,encoding,value
settings,namespace,,
ip_sta,data,string,192.168.2.20
wifi_hostname,data,string,drone20
ssid_ap,data,string,DroneBridge20
";

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Default)]
struct FakeAuthority {
    offline: AtomicBool,
    reject: AtomicBool,
    requests: AtomicUsize,
}

#[async_trait]
impl LicenseProvider for FakeAuthority {
    async fn request_license(&self, key: &ActivationKey) -> ProvisionResult<License> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(ProvisionError::license(LicenseErrorKind::QuotaExceeded, "no credit"));
        }
        License::new(*key, format!("issued-{}", key).into_bytes())
    }

    async fn is_available(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

struct Bench {
    dir: tempfile::TempDir,
    connector: MockSerialConnector,
    authority: Arc<FakeAuthority>,
}

impl Bench {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_release(dir.path());
        std::fs::write(dir.path().join("db_settings.csv"), USER_SETTINGS).unwrap();
        Self {
            dir,
            connector: MockSerialConnector::new(),
            authority: Arc::new(FakeAuthority::default()),
        }
    }

    fn config(&self, sequencer: &str) -> ProvisionConfig {
        let root = self.dir.path().display().to_string().replace('\\', "/");
        ProvisionConfig::from_toml(&format!(
            r#"
[license]
base_url = "http://127.0.0.1:9"
token = "{TOKEN}"
storage_dir = "{root}/licenses"

[settings]
path = "{root}/db_settings.csv"

[sequencer]
{sequencer}

[image]
release_dir = "{root}/release"

[serial]
retry_delay_ms = 0

[serial.connector]
type = "mock"
"#
        ))
        .unwrap()
    }

    fn provisioner(&self, config: ProvisionConfig) -> Provisioner {
        self.provisioner_flashing_through(config, Arc::new(self.connector.clone()))
    }

    fn provisioner_flashing_through(
        &self,
        config: ProvisionConfig,
        flash_connector: Arc<dyn SerialConnector>,
    ) -> Provisioner {
        let serial = SerialConfig {
            retry_delay_ms: 0,
            ..config.serial.clone()
        };
        Provisioner::new(
            config,
            AccountToken::new(TOKEN).unwrap(),
            Arc::new(SerialIdentityResolver::new(Arc::new(self.connector.clone()), &serial)),
            self.authority.clone(),
            SerialFlasher::new(flash_connector, serial),
        )
    }

    fn settings_path(&self) -> PathBuf {
        self.dir.path().join("db_settings.csv")
    }

    fn store(&self) -> LicenseStore {
        LicenseStore::new(self.dir.path().join("licenses"))
    }

    fn settings_file(&self) -> SettingsRecord {
        SettingsRecord::load(self.dir.path().join("db_settings.csv")).unwrap()
    }

    /// Settings the device on `port` received in its last flash
    fn flashed_settings(&self, port: &str) -> SettingsRecord {
        let flashed = self.connector.flashed(port);
        let image = flashed.last().unwrap();
        let start = (DEFAULT_SETTINGS_OFFSET - image.base_offset) as usize;
        codec::decode(&image.data[start..start + 0x6000]).unwrap()
    }
}

fn write_release(dir: &Path) {
    let folder = release_folder(&dir.join("release"), ChipVariant::Esp32C5);
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(
        folder.join(FLASH_ARGS_FILE),
        "--flash_size 2MB\n0x0 bootloader/bootloader.bin\n0x8000 partition_table/partition-table.bin\n0x10000 db_esp32c5.bin\n0x110000 www.bin\n",
    )
    .unwrap();
    std::fs::write(folder.join("bootloader.bin"), vec![0x11; 0x1000]).unwrap();
    std::fs::write(folder.join("partition-table.bin"), vec![0x22; 0xC00]).unwrap();
    std::fs::write(folder.join("db_esp32c5.bin"), vec![0x33; 0x8000]).unwrap();
    std::fs::write(folder.join("www.bin"), vec![0x44; 0x2000]).unwrap();
}

/// Replaces the settings file with a directory once flashing starts, so the
/// sequenced values cannot be written back
struct UnwritableSettings {
    inner: MockSerialConnector,
    settings: PathBuf,
}

#[async_trait]
impl SerialConnector for UnwritableSettings {
    async fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, TransportError> {
        if self.settings.is_file() {
            std::fs::remove_file(&self.settings).unwrap();
            std::fs::create_dir(&self.settings).unwrap();
        }
        self.inner.open(port, baud_rate).await
    }

    async fn list_ports(&self) -> Result<Vec<String>, TransportError> {
        self.inner.list_ports().await
    }
}

fn device(last: u8) -> MockDevice {
    MockDevice::new(DeviceIdentity::new([0x24, 0x6F, 0x28, 0, 0, last]), ChipVariant::Esp32C5)
}

fn key_for(last: u8) -> ActivationKey {
    derive(
        &DeviceIdentity::new([0x24, 0x6F, 0x28, 0, 0, last]),
        &AccountToken::new(TOKEN).unwrap(),
    )
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_provision_embeds_license_and_advances_sequence() {
    let bench = Bench::new();
    bench.connector.attach(PORT, device(1));
    let provisioner = bench.provisioner(bench.config("enabled = true"));

    let report = provisioner.provision(PORT, None).await.unwrap();
    assert_eq!(report.license_source, LicenseSource::Authority);
    assert_eq!(report.activation_key, key_for(1));
    assert_eq!(report.ip_sta.as_deref(), Some("192.168.2.21"));
    assert_eq!(report.flash.attempts, 1);

    let settings = bench.flashed_settings(PORT);
    let expected = License::new(key_for(1), format!("issued-{}", key_for(1)).into_bytes()).unwrap();
    assert_eq!(settings.get("dlse_lic"), Some(expected.to_base64().as_str()));
    assert_eq!(settings.get("wifi_hostname"), Some("drone21"));

    // The next run continues from the stored values
    let stored = bench.settings_file();
    assert_eq!(stored.get("ip_sta"), Some("192.168.2.21"));
    assert!(!stored.contains("dlse_lic"));

    let again = provisioner.provision(PORT, None).await.unwrap();
    assert_eq!(again.ip_sta.as_deref(), Some("192.168.2.22"));
}

#[tokio::test]
async fn test_start_index_applies_once_then_advances() {
    let bench = Bench::new();
    bench.connector.attach(PORT, device(1));
    let provisioner = bench.provisioner(bench.config("enabled = true\nstart_index = 30"));

    let first = provisioner.provision(PORT, None).await.unwrap();
    let second = provisioner.provision(PORT, None).await.unwrap();
    assert_eq!(first.ip_sta.as_deref(), Some("192.168.2.30"));
    assert_eq!(second.ip_sta.as_deref(), Some("192.168.2.31"));
    assert_eq!(bench.flashed_settings(PORT).get("wifi_hostname"), Some("drone31"));
    assert_eq!(bench.settings_file().get("ip_sta"), Some("192.168.2.31"));

    // A fresh session against the same file continues the sequence
    let third = bench
        .provisioner(bench.config("enabled = true\nstart_index = 30"))
        .provision(PORT, None)
        .await
        .unwrap();
    assert_eq!(third.ip_sta.as_deref(), Some("192.168.2.32"));
}

#[tokio::test]
async fn test_start_index_below_stored_values_advances() {
    let bench = Bench::new();
    bench.connector.attach(PORT, device(1));
    let provisioner = bench.provisioner(bench.config("enabled = true\nstart_index = 5"));

    let first = provisioner.provision(PORT, None).await.unwrap();
    let second = provisioner.provision(PORT, None).await.unwrap();
    assert_eq!(first.ip_sta.as_deref(), Some("192.168.2.21"));
    assert_eq!(second.ip_sta.as_deref(), Some("192.168.2.22"));
}

#[tokio::test]
async fn test_unstored_sequence_fails_the_run() {
    let bench = Bench::new();
    bench.connector.attach(PORT, device(1));
    let connector = Arc::new(UnwritableSettings {
        inner: bench.connector.clone(),
        settings: bench.settings_path(),
    });
    let provisioner = bench.provisioner_flashing_through(bench.config("enabled = true"), connector);

    let err = provisioner.provision(PORT, None).await.unwrap_err();
    assert_eq!(err.stage, Stage::Persist);
    assert_eq!(err.identity, Some(DeviceIdentity::new([0x24, 0x6F, 0x28, 0, 0, 1])));
    // The device itself was flashed
    assert_eq!(bench.connector.flashed(PORT).len(), 1);
}

#[tokio::test]
async fn test_watch_halts_when_sequence_cannot_be_stored() {
    let bench = Bench::new();
    let connector = Arc::new(UnwritableSettings {
        inner: bench.connector.clone(),
        settings: bench.settings_path(),
    });
    let provisioner = bench.provisioner_flashing_through(bench.config("enabled = true"), connector);
    let mut watcher = FleetWatcher::new(
        provisioner,
        Arc::new(bench.connector.clone()),
        WatchConfig {
            settle_delay: std::time::Duration::ZERO,
            ignore_existing: false,
            ..WatchConfig::default()
        },
    );
    bench.connector.attach("mock1", device(11));
    bench.connector.attach("mock2", device(12));

    let results = watcher.poll_once().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap_err().stage, Stage::Persist);
    assert!(watcher.summary().halted);
    assert!(bench.connector.flashed("mock2").is_empty());

    let summary = watcher.run(std::future::pending()).await;
    assert!(summary.halted);
    assert!(bench.connector.flashed("mock2").is_empty());
}

#[tokio::test]
async fn test_offline_uses_local_store() {
    let bench = Bench::new();
    bench.connector.attach(PORT, device(2));
    let stored = License::new(key_for(2), b"stored-license".to_vec()).unwrap();
    bench.store().save(&stored).unwrap();
    bench.authority.offline.store(true, Ordering::SeqCst);

    let report = bench
        .provisioner(bench.config("enabled = false"))
        .provision(PORT, None)
        .await
        .unwrap();
    assert_eq!(report.license_source, LicenseSource::LocalStore);
    assert_eq!(bench.authority.requests.load(Ordering::SeqCst), 0);
    assert_eq!(
        bench.flashed_settings(PORT).get("dlse_lic"),
        Some(stored.to_base64().as_str())
    );
}

#[tokio::test]
async fn test_offline_reads_license_back_from_device() {
    let bench = Bench::new();
    bench
        .connector
        .attach(PORT, device(3).with_installed_license(b"on-device".to_vec()));
    bench.authority.offline.store(true, Ordering::SeqCst);

    let report = bench
        .provisioner(bench.config("enabled = false"))
        .provision(PORT, None)
        .await
        .unwrap();
    assert_eq!(report.license_source, LicenseSource::Device);
    let saved = bench.store().load(&key_for(3)).unwrap().unwrap();
    assert_eq!(saved.blob(), b"on-device");
}

#[tokio::test]
async fn test_offline_without_any_license_leaves_device_untouched() {
    let bench = Bench::new();
    bench.connector.attach(PORT, device(4));
    bench.authority.offline.store(true, Ordering::SeqCst);

    let err = bench
        .provisioner(bench.config("enabled = false"))
        .provision(PORT, None)
        .await
        .unwrap_err();
    assert_eq!(err.stage, Stage::License);
    assert_eq!(err.port, PORT);
    assert_eq!(err.identity, Some(DeviceIdentity::new([0x24, 0x6F, 0x28, 0, 0, 4])));
    assert!(err.to_string().contains("24:6F:28:00:00:04"));
    assert!(bench.connector.flashed(PORT).is_empty());
}

#[tokio::test]
async fn test_permanent_license_error_is_fatal() {
    let bench = Bench::new();
    bench.connector.attach(PORT, device(5).with_installed_license(b"on-device".to_vec()));
    bench.authority.reject.store(true, Ordering::SeqCst);

    let err = bench
        .provisioner(bench.config("enabled = false"))
        .provision(PORT, None)
        .await
        .unwrap_err();
    assert_eq!(err.stage, Stage::License);
    assert!(matches!(
        err.source,
        ProvisionError::LicenseServer {
            kind: LicenseErrorKind::QuotaExceeded,
            ..
        }
    ));
    assert!(bench.connector.flashed(PORT).is_empty());
}

#[tokio::test]
async fn test_missing_device_fails_identity_stage() {
    let bench = Bench::new();
    let err = bench
        .provisioner(bench.config("enabled = false"))
        .provision("nowhere", None)
        .await
        .unwrap_err();
    assert_eq!(err.stage, Stage::Identity);
    assert_eq!(err.identity, None);
}

#[tokio::test]
async fn test_watch_numbers_new_devices() {
    let bench = Bench::new();
    bench.connector.attach("already-here", device(9));
    let config = bench.config("enabled = true\nstart_index = 10");
    let mut watcher = FleetWatcher::new(
        bench.provisioner(config),
        Arc::new(bench.connector.clone()),
        WatchConfig {
            settle_delay: std::time::Duration::ZERO,
            ..WatchConfig::default()
        },
    );
    watcher.prime().await;
    assert!(watcher.poll_once().await.is_empty());

    bench.connector.attach("mock1", device(11));
    bench.connector.attach("mock2", device(12));
    let results = watcher.poll_once().await;
    let ips: Vec<Option<String>> = results
        .into_iter()
        .map(|r| r.unwrap().ip_sta)
        .collect();
    assert_eq!(
        ips,
        vec![Some("192.168.2.10".to_string()), Some("192.168.2.11".to_string())]
    );
    assert_eq!(watcher.next_index(), Some(12));
    assert_eq!(watcher.summary().provisioned, 2);
    assert!(bench.connector.flashed("already-here").is_empty());

    // Seen devices are not provisioned twice while attached
    assert!(watcher.poll_once().await.is_empty());
    bench.connector.detach("mock1");
    watcher.poll_once().await;
    bench.connector.attach("mock1", device(11));
    assert_eq!(watcher.poll_once().await.len(), 1);
}
