//! Partition maps
//!
//! A partition map names the flash regions of one chip variant with their
//! fixed offset, capacity and content. Maps come either from a YAML document
//! keyed by chip variant or from a release's `flash_args.txt`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use prov_core::{ChipVariant, PartitionErrorKind, ProvisionError, ProvisionResult};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

/// Offset of the settings partition on every supported chip
pub const DEFAULT_SETTINGS_OFFSET: u32 = 0x9000;
/// Size of the settings partition
pub const DEFAULT_SETTINGS_SIZE: u32 = 0x6000;
/// Flash size assumed when a release does not state one
pub const DEFAULT_FLASH_SIZE: u32 = 4 * 1024 * 1024;
/// Name of the settings region
pub const SETTINGS_REGION: &str = "settings";
/// Name of the application region
pub const APP_REGION: &str = "app";
/// Name of the flash layout file inside a chip's release folder
pub const FLASH_ARGS_FILE: &str = "flash_args.txt";

/// Binaries of a release that keep their own region name
const NAMED_BINARIES: &[&str] = &["bootloader", "partition-table", "ota_data_initial", "www"];

/// What a region holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionContent {
    /// A binary from the release, looked up by region name
    Firmware,
    /// The encoded settings record
    Settings,
    /// The raw license blob, length prefixed
    License,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    #[serde(deserialize_with = "de_u32")]
    pub offset: u32,
    #[serde(deserialize_with = "de_u32")]
    pub size: u32,
    pub content: RegionContent,
    /// Binary file name for firmware regions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Region {
    pub fn new(name: impl Into<String>, offset: u32, size: u32, content: RegionContent) -> Self {
        Self {
            name: name.into(),
            offset,
            size,
            content,
            file: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// First byte past the region
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMap {
    #[serde(default = "default_flash_size", deserialize_with = "de_u32")]
    pub flash_size: u32,
    pub regions: Vec<Region>,
}

fn default_flash_size() -> u32 {
    DEFAULT_FLASH_SIZE
}

impl PartitionMap {
    pub fn new(flash_size: u32, regions: Vec<Region>) -> Self {
        Self {
            flash_size,
            regions,
        }
    }

    /// Parse a single map from YAML
    pub fn from_yaml(yaml: &str) -> ProvisionResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ProvisionError::partition(PartitionErrorKind::InvalidMap, "<map>", e.to_string())
        })
    }

    /// Load the map for `chip` from a YAML document keyed by chip variant
    pub fn load_for_chip(path: impl AsRef<Path>, chip: ChipVariant) -> ProvisionResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut maps: BTreeMap<String, PartitionMap> = serde_yaml::from_str(&text).map_err(|e| {
            ProvisionError::partition(PartitionErrorKind::InvalidMap, "<map>", e.to_string())
        })?;
        maps.remove(chip.name()).ok_or_else(|| {
            ProvisionError::partition(
                PartitionErrorKind::InvalidMap,
                "<map>",
                format!("no partition map for chip {}", chip),
            )
        })
    }

    /// Build the map of a release from its `flash_args.txt`
    ///
    /// Firmware binaries keep their listed offsets; the settings region is
    /// always placed at `settings_offset`. A region extends to the next
    /// region, the last one to the end of flash.
    pub fn from_flash_args(
        text: &str,
        settings_offset: u32,
        settings_size: u32,
    ) -> ProvisionResult<Self> {
        let mut flash_size = DEFAULT_FLASH_SIZE;
        let mut entries: Vec<(u32, String)> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let invalid = |m: String| {
                ProvisionError::partition(
                    PartitionErrorKind::InvalidMap,
                    FLASH_ARGS_FILE,
                    format!("line {}: {}", idx + 1, m),
                )
            };
            if line.starts_with("--") {
                let mut parts = line.split_whitespace();
                while let Some(option) = parts.next() {
                    if option == "--flash_size" {
                        let value = parts
                            .next()
                            .ok_or_else(|| invalid("--flash_size without a value".to_string()))?;
                        if value != "keep" && value != "detect" {
                            flash_size = parse_size(value).map_err(invalid)?;
                        }
                    }
                }
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(offset), Some(path)) = (parts.next(), parts.next()) else {
                return Err(invalid(format!("expected '<offset> <file>', got '{}'", line)));
            };
            let offset = parse_u32(offset).map_err(invalid)?;
            let file = Path::new(path)
                .file_name()
                .and_then(|f| f.to_str())
                .ok_or_else(|| invalid(format!("no file name in '{}'", path)))?
                .to_string();
            if offset != settings_offset {
                entries.push((offset, file));
            }
        }

        entries.sort_by_key(|(offset, _)| *offset);
        let mut starts: Vec<u32> = entries.iter().map(|(o, _)| *o).collect();
        starts.push(settings_offset);
        starts.sort_unstable();

        let mut regions = Vec::with_capacity(entries.len() + 1);
        let mut app_named = false;
        for (offset, file) in entries {
            let next = starts
                .iter()
                .copied()
                .find(|s| *s > offset)
                .unwrap_or(flash_size);
            let size = next.checked_sub(offset).filter(|s| *s > 0).ok_or_else(|| {
                ProvisionError::partition(
                    PartitionErrorKind::InvalidMap,
                    file.clone(),
                    format!("offset 0x{:x} lies outside flash", offset),
                )
            })?;
            let stem = file.strip_suffix(".bin").unwrap_or(&file).to_string();
            let name = if NAMED_BINARIES.contains(&stem.as_str()) {
                stem
            } else if !app_named {
                app_named = true;
                APP_REGION.to_string()
            } else {
                stem
            };
            regions.push(Region::new(name, offset, size, RegionContent::Firmware).with_file(file));
        }
        regions.push(Region::new(
            SETTINGS_REGION,
            settings_offset,
            settings_size,
            RegionContent::Settings,
        ));
        regions.sort_by_key(|r| r.offset);

        let map = Self::new(flash_size, regions);
        map.validate()?;
        Ok(map)
    }

    /// Load the map of `chip` from `<release_dir>/<chip>_generic/flash_args.txt`
    pub fn from_release(
        release_dir: impl AsRef<Path>,
        chip: ChipVariant,
        settings_offset: u32,
        settings_size: u32,
    ) -> ProvisionResult<Self> {
        let path = release_folder(release_dir.as_ref(), chip).join(FLASH_ARGS_FILE);
        let text = std::fs::read_to_string(&path)?;
        debug!(path = %path.display(), "Reading flash layout");
        Self::from_flash_args(&text, settings_offset, settings_size)
    }

    pub fn region(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// Check that region names are unique, regions are non-empty, fit in
    /// flash and do not overlap
    pub fn validate(&self) -> ProvisionResult<()> {
        let invalid = |region: &str, message: String| {
            ProvisionError::partition(PartitionErrorKind::InvalidMap, region, message)
        };
        if self.regions.is_empty() {
            return Err(invalid("<map>", "map has no regions".to_string()));
        }

        let mut names = HashSet::new();
        for region in &self.regions {
            if region.name.is_empty() {
                return Err(invalid("<unnamed>", "region without a name".to_string()));
            }
            if !names.insert(region.name.as_str()) {
                return Err(invalid(&region.name, "duplicate region name".to_string()));
            }
            if region.size == 0 {
                return Err(invalid(&region.name, "region has zero size".to_string()));
            }
            if region.end() > u64::from(self.flash_size) {
                return Err(invalid(
                    &region.name,
                    format!(
                        "region ends at 0x{:x}, beyond flash size 0x{:x}",
                        region.end(),
                        self.flash_size
                    ),
                ));
            }
        }

        let mut sorted: Vec<&Region> = self.regions.iter().collect();
        sorted.sort_by_key(|r| r.offset);
        for pair in sorted.windows(2) {
            if pair[0].end() > u64::from(pair[1].offset) {
                return Err(invalid(
                    &pair[1].name,
                    format!("overlaps region '{}'", pair[0].name),
                ));
            }
        }
        Ok(())
    }

    /// Read every firmware binary of the map from `dir`
    pub fn load_payloads(&self, dir: impl AsRef<Path>) -> ProvisionResult<BTreeMap<String, Vec<u8>>> {
        let mut payloads = BTreeMap::new();
        for (region, path) in self.firmware_files(dir.as_ref()) {
            let data = std::fs::read(&path).map_err(|e| {
                ProvisionError::partition(
                    PartitionErrorKind::MissingPayload,
                    region.as_str(),
                    format!("{}: {}", path.display(), e),
                )
            })?;
            payloads.insert(region, data);
        }
        Ok(payloads)
    }

    fn firmware_files(&self, dir: &Path) -> Vec<(String, PathBuf)> {
        self.regions
            .iter()
            .filter(|r| r.content == RegionContent::Firmware)
            .map(|r| {
                let file = r.file.clone().unwrap_or_else(|| format!("{}.bin", r.name));
                (r.name.clone(), dir.join(file))
            })
            .collect()
    }
}

/// Folder holding the binaries of `chip` inside a release
pub fn release_folder(release_dir: &Path, chip: ChipVariant) -> PathBuf {
    release_dir.join(chip.release_folder())
}

/// Verify a release contains the flash layout and every binary it lists
pub fn check_release(
    release_dir: impl AsRef<Path>,
    chip: ChipVariant,
) -> ProvisionResult<PartitionMap> {
    let folder = release_folder(release_dir.as_ref(), chip);
    let args = folder.join(FLASH_ARGS_FILE);
    if !args.is_file() {
        return Err(ProvisionError::partition(
            PartitionErrorKind::MissingPayload,
            FLASH_ARGS_FILE,
            format!("{} not found", args.display()),
        ));
    }
    let map = PartitionMap::from_release(
        release_dir,
        chip,
        DEFAULT_SETTINGS_OFFSET,
        DEFAULT_SETTINGS_SIZE,
    )?;
    for (region, path) in map.firmware_files(&folder) {
        if !path.is_file() {
            return Err(ProvisionError::partition(
                PartitionErrorKind::MissingPayload,
                region,
                format!("{} not found", path.display()),
            ));
        }
    }
    Ok(map)
}

/// Parse `0x1000`, `4096`
pub fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid number '{}'", s))
}

/// Parse a flash size such as `4MB`, `512KB` or a plain number
fn parse_size(s: &str) -> Result<u32, String> {
    let upper = s.trim().to_ascii_uppercase();
    let (digits, factor) = if let Some(d) = upper.strip_suffix("MB") {
        (d, 1024 * 1024)
    } else if let Some(d) = upper.strip_suffix("KB") {
        (d, 1024)
    } else {
        return parse_u32(s);
    };
    digits
        .parse::<u32>()
        .ok()
        .and_then(|n| n.checked_mul(factor))
        .ok_or_else(|| format!("invalid flash size '{}'", s))
}

/// Deserialize a number given either as an integer or as a `0x` string
pub fn de_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u32),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => parse_u32(&s).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FLASH_ARGS: &str = "\
--flash_mode dio --flash_freq 80m --flash_size 4MB
0x0 bootloader/bootloader.bin
0x10000 db_esp32c5.bin
0x8000 partition_table/partition-table.bin
0xf000 ota_data_initial.bin
0x310000 www.bin
";

    #[test]
    fn test_from_flash_args() {
        let map = PartitionMap::from_flash_args(FLASH_ARGS, 0x9000, 0x6000).unwrap();
        let names: Vec<&str> = map.regions.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["bootloader", "partition-table", "settings", "ota_data_initial", "app", "www"]
        );
        let app = map.region("app").unwrap();
        assert_eq!(app.file.as_deref(), Some("db_esp32c5.bin"));
        assert_eq!(app.size, 0x300000);
        assert_eq!(map.region("partition-table").unwrap().size, 0x1000);
        assert_eq!(map.region("www").unwrap().size, 0x400000 - 0x310000);
        assert_eq!(map.region("settings").unwrap().size, 0x6000);
    }

    #[test]
    fn test_flash_args_rejects_garbage() {
        assert!(PartitionMap::from_flash_args("0xZZ boot.bin\n", 0x9000, 0x6000).is_err());
        assert!(PartitionMap::from_flash_args("0x0\n", 0x9000, 0x6000).is_err());
        // Settings partition would run into the next binary
        assert!(PartitionMap::from_flash_args("0x0 a.bin\n0xa000 b.bin\n", 0x9000, 0x6000).is_err());
    }

    #[test]
    fn test_yaml_map_with_hex_strings() {
        let yaml = r#"
flash_size: "0x400000"
regions:
  - { name: app, offset: "0x10000", size: "0x100000", content: firmware, file: app.bin }
  - { name: settings, offset: 0x9000, size: 24576, content: settings }
  - { name: license, offset: "0xF000", size: "0x1000", content: license }
"#;
        let map = PartitionMap::from_yaml(yaml).unwrap();
        assert_eq!(map.region("settings").unwrap().offset, 0x9000);
        assert_eq!(map.region("license").unwrap().content, RegionContent::License);
        map.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_overlap_and_empty() {
        let overlap = PartitionMap::new(
            0x10000,
            vec![
                Region::new("a", 0x0, 0x2000, RegionContent::Firmware),
                Region::new("b", 0x1000, 0x1000, RegionContent::Settings),
            ],
        );
        let err = overlap.validate().unwrap_err();
        assert!(err.to_string().contains("invalid-map"));
        assert!(err.to_string().contains("'b'"));

        let empty = PartitionMap::new(0x10000, vec![Region::new("a", 0x0, 0, RegionContent::Firmware)]);
        assert!(empty.validate().is_err());
        assert!(PartitionMap::new(0x10000, vec![]).validate().is_err());
    }

    #[test]
    fn test_check_release() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("esp32c3_generic");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join(FLASH_ARGS_FILE), "0x0 bootloader/bootloader.bin\n0x10000 db.bin\n").unwrap();
        std::fs::write(folder.join("bootloader.bin"), [0u8; 16]).unwrap();

        let err = check_release(dir.path(), ChipVariant::Esp32C3).unwrap_err();
        assert!(err.to_string().contains("missing-payload"));

        std::fs::write(folder.join("db.bin"), [0u8; 16]).unwrap();
        let map = check_release(dir.path(), ChipVariant::Esp32C3).unwrap();
        let payloads = map.load_payloads(&folder).unwrap();
        assert_eq!(payloads.len(), 2);
        assert!(check_release(dir.path(), ChipVariant::Esp32C5).is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4MB"), Ok(4 * 1024 * 1024));
        assert_eq!(parse_size("512KB"), Ok(512 * 1024));
        assert_eq!(parse_size("0x1000"), Ok(0x1000));
    }
}
