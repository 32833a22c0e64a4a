//! prov-pipeline - Device provisioning pipeline
//!
//! Wires the stages together for one device on a serial port:
//! identity → activation key → license → settings → image → delivery.
//! Also provides the TOML run configuration and the fleet watch loop that
//! provisions devices as they are plugged in.

pub mod config;
pub mod pipeline;
pub mod watch;

pub use config::{ConfigError, ImageSection, LicenseSection, ProvisionConfig, SettingsSection};
pub use pipeline::{
    build_image, load_settings, partition_map, prepare_settings, LicenseSource, PipelineError,
    PreparedSettings, ProvisionReport, Provisioner, Stage,
};
pub use watch::{FleetWatcher, WatchConfig, WatchSummary};
