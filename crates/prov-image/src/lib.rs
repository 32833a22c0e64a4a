//! prov-image - Settings, parameter sequencing and image composition
//!
//! This crate provides:
//! - the settings store (tabular text files, merge, license embedding)
//! - the parameter sequencer for fleet-unique values
//! - partition maps from YAML or a release's `flash_args.txt`
//! - the binary settings codec
//! - the image composer producing byte-exact flash images

pub mod codec;
pub mod compose;
pub mod partition;
pub mod sequencer;
pub mod settings;

pub use compose::{compose, compose_with_fill, PartitionImage, Placement, DEFAULT_FILL};
pub use partition::{
    check_release, PartitionMap, Region, RegionContent, APP_REGION, DEFAULT_SETTINGS_OFFSET,
    DEFAULT_SETTINGS_SIZE, SETTINGS_REGION,
};
pub use sequencer::{FieldKind, SequencedField, SequencerConfig};
pub use settings::{
    embed_license, merge, merge_files, SettingsLine, SettingsRecord, SettingsRow,
    DEFAULT_LICENSE_KEY, DEFAULT_NAMESPACE,
};
