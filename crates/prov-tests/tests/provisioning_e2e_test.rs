//! Full provisioning runs against the mock authority and simulated devices
//!
//! Run with: cargo test -p prov-tests --test provisioning_e2e_test

use std::time::Duration;

use pretty_assertions::assert_eq;
use prov_core::{derive, AccountToken, ChipVariant, License, LicenseErrorKind, ProvisionError};
use prov_delivery::MockDevice;
use prov_image::SettingsRecord;
use prov_pipeline::{FleetWatcher, LicenseSource, Stage, WatchConfig};
use prov_tests::{identity, Bench, MockAuthority, TOKEN};

fn device(n: u8) -> MockDevice {
    MockDevice::new(identity(n), ChipVariant::Esp32C5)
}

fn token() -> AccountToken {
    AccountToken::new(TOKEN).unwrap()
}

// =============================================================================
// Online runs
// =============================================================================

#[tokio::test]
async fn test_provision_flashes_licensed_settings() {
    let authority = MockAuthority::start(TOKEN).await.unwrap();
    let bench = Bench::new().unwrap();
    bench.connector.attach("mock0", device(1));
    let config = bench.config(&authority.base_url(), "enabled = true").unwrap();

    let report = bench.provisioner(&config).unwrap().provision("mock0", None).await.unwrap();

    let key = derive(&identity(1), &token());
    let license = MockAuthority::license_for(&key).unwrap();
    assert_eq!(report.activation_key, key);
    assert_eq!(report.license_source, LicenseSource::Authority);
    assert_eq!(report.flash.attempts, 1);

    let flashed = bench.flashed_settings("mock0").unwrap().unwrap();
    assert_eq!(flashed.get("dlse_lic"), Some(license.to_base64().as_str()));
    assert_eq!(flashed.get("ip_sta"), Some("192.168.50.11"));
    assert_eq!(flashed.get("wifi_pass"), Some("dronebridge"));

    // Issued license cached locally, sequence persisted without it
    assert_eq!(bench.store().load(&key).unwrap(), Some(license));
    let stored = SettingsRecord::load(bench.settings_path()).unwrap();
    assert_eq!(stored.get("ip_sta"), Some("192.168.50.11"));
    assert!(!stored.contains("dlse_lic"));
}

#[tokio::test]
async fn test_reprovisioning_a_device_is_billed_once() {
    let authority = MockAuthority::start(TOKEN).await.unwrap();
    let bench = Bench::new().unwrap();
    bench.connector.attach("mock0", device(4));
    let config = bench.config(&authority.base_url(), "enabled = false").unwrap();

    // Fresh provisioners, as on two separate operator sessions
    let first = bench.provisioner(&config).unwrap().provision("mock0", None).await.unwrap();
    let second = bench.provisioner(&config).unwrap().provision("mock0", None).await.unwrap();

    assert_eq!(first.image_sha256, second.image_sha256);
    assert_eq!(authority.requests(), 2);
    assert_eq!(authority.billing_events(), 1);
    assert_eq!(bench.connector.flashed("mock0").len(), 2);
}

#[tokio::test]
async fn test_rejected_token_is_fatal() {
    let authority = MockAuthority::start("some-other-account").await.unwrap();
    let bench = Bench::new().unwrap();
    bench.connector.attach("mock0", device(1));
    let config = bench.config(&authority.base_url(), "enabled = false").unwrap();

    let err = bench.provisioner(&config).unwrap().provision("mock0", None).await.unwrap_err();

    assert_eq!(err.stage, Stage::License);
    assert!(matches!(
        err.source,
        ProvisionError::LicenseServer {
            kind: LicenseErrorKind::InvalidToken,
            ..
        }
    ));
    assert_eq!(authority.requests(), 1);
    assert!(bench.connector.flashed("mock0").is_empty());
}

#[tokio::test]
async fn test_quota_exceeded_does_not_fall_back() {
    let authority = MockAuthority::start(TOKEN).await.unwrap();
    authority.set_out_of_credit(true);
    let bench = Bench::new().unwrap();
    bench.connector.attach(
        "mock0",
        device(2).with_installed_license(b"installed".to_vec()),
    );
    let config = bench.config(&authority.base_url(), "enabled = false").unwrap();

    let err = bench.provisioner(&config).unwrap().provision("mock0", None).await.unwrap_err();

    assert!(matches!(
        err.source,
        ProvisionError::LicenseServer {
            kind: LicenseErrorKind::QuotaExceeded,
            ..
        }
    ));
    assert!(bench.connector.flashed("mock0").is_empty());
}

// =============================================================================
// Offline runs
// =============================================================================

#[tokio::test]
async fn test_offline_authority_uses_stored_license() {
    let authority = MockAuthority::start(TOKEN).await.unwrap();
    authority.set_offline(true);
    let bench = Bench::new().unwrap();
    bench.connector.attach("mock0", device(5));
    let key = derive(&identity(5), &token());
    let stored = License::new(key, b"stored-earlier".to_vec()).unwrap();
    bench.store().save(&stored).unwrap();
    let config = bench.config(&authority.base_url(), "enabled = false").unwrap();

    let report = bench.provisioner(&config).unwrap().provision("mock0", None).await.unwrap();

    assert_eq!(report.license_source, LicenseSource::LocalStore);
    let flashed = bench.flashed_settings("mock0").unwrap().unwrap();
    assert_eq!(flashed.get("dlse_lic"), Some(stored.to_base64().as_str()));
    assert_eq!(authority.billing_events(), 0);
}

#[tokio::test]
async fn test_offline_authority_keeps_installed_license() {
    let authority = MockAuthority::start(TOKEN).await.unwrap();
    authority.set_offline(true);
    let bench = Bench::new().unwrap();
    bench.connector.attach(
        "mock0",
        device(6).with_installed_license(b"installed-on-device".to_vec()),
    );
    let config = bench.config(&authority.base_url(), "enabled = false").unwrap();

    let report = bench.provisioner(&config).unwrap().provision("mock0", None).await.unwrap();

    assert_eq!(report.license_source, LicenseSource::Device);
    let key = derive(&identity(6), &token());
    let saved = bench.store().load(&key).unwrap().unwrap();
    assert_eq!(saved.blob(), b"installed-on-device");
    let flashed = bench.flashed_settings("mock0").unwrap().unwrap();
    assert_eq!(flashed.get("dlse_lic"), Some(saved.to_base64().as_str()));
}

#[tokio::test]
async fn test_offline_without_any_license_leaves_device_untouched() {
    let authority = MockAuthority::start(TOKEN).await.unwrap();
    authority.set_offline(true);
    let bench = Bench::new().unwrap();
    bench.connector.attach("mock0", device(7));
    let config = bench.config(&authority.base_url(), "enabled = true").unwrap();

    let err = bench.provisioner(&config).unwrap().provision("mock0", None).await.unwrap_err();

    assert_eq!(err.stage, Stage::License);
    assert_eq!(err.port, "mock0");
    assert_eq!(err.identity, Some(identity(7)));
    assert!(bench.connector.flashed("mock0").is_empty());
    // Nothing consumed from the sequence either
    let stored = SettingsRecord::load(bench.settings_path()).unwrap();
    assert_eq!(stored.get("ip_sta"), Some("192.168.50.10"));
}

// =============================================================================
// Fleet watch
// =============================================================================

#[tokio::test]
async fn test_watch_numbers_devices_from_start_index() {
    let authority = MockAuthority::start(TOKEN).await.unwrap();
    let bench = Bench::new().unwrap();
    bench.connector.attach("mock0", device(1));
    bench.connector.attach("mock1", device(2));
    let config = bench
        .config(&authority.base_url(), "enabled = true\nstart_index = 30")
        .unwrap();

    let mut watcher = FleetWatcher::new(
        bench.provisioner(&config).unwrap(),
        std::sync::Arc::new(bench.connector.clone()),
        WatchConfig {
            poll_interval: Duration::from_millis(20),
            settle_delay: Duration::ZERO,
            ignore_existing: false,
        },
    );
    let summary = watcher.run(tokio::time::sleep(Duration::from_millis(300))).await;

    assert_eq!(summary.provisioned, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(watcher.next_index(), Some(32));
    let first = bench.flashed_settings("mock0").unwrap().unwrap();
    let second = bench.flashed_settings("mock1").unwrap().unwrap();
    assert_eq!(first.get("ip_sta"), Some("192.168.50.30"));
    assert_eq!(second.get("ip_sta"), Some("192.168.50.31"));
    assert_eq!(second.get("wifi_hostname"), Some("drone31"));
    assert_eq!(authority.billing_events(), 2);
}
