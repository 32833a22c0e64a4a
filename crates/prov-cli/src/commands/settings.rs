//! Settings commands - merge and sequence settings files

use std::path::Path;

use anyhow::{Context, Result};
use prov_image::sequencer::{advance, apply_overrides, assign, default_fields};
use prov_image::{merge_files, SettingsRecord};

use crate::output::{OutputContext, SettingRow};

/// Merge a user settings file into the release settings
pub fn merge(release: &Path, user: &Path, ctx: &OutputContext) -> Result<()> {
    let out = merge_files(release, user).with_context(|| {
        format!(
            "Failed to merge {} into {}",
            user.display(),
            release.display()
        )
    })?;
    ctx.success(&format!("Merged settings written to {}", out.display()));
    Ok(())
}

/// Operator overrides of the sequenced parameters
#[derive(Debug, Default)]
pub struct Overrides<'a> {
    pub ip: Option<&'a str>,
    pub hostname: Option<&'a str>,
    pub ssid_ap: Option<&'a str>,
}

impl Overrides<'_> {
    fn pairs(&self) -> Vec<(String, String)> {
        [
            ("ip_sta", self.ip),
            ("wifi_hostname", self.hostname),
            ("ssid_ap", self.ssid_ap),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name.to_string(), v.to_string())))
        .collect()
    }
}

/// Compute the next device's parameters from a settings file
///
/// With `write` the file is updated in place.
pub fn sequence(
    file: &Path,
    index: Option<u32>,
    overrides: &Overrides<'_>,
    write: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let record = SettingsRecord::load(file)
        .with_context(|| format!("Failed to load settings: {}", file.display()))?;
    let fields = default_fields();

    let mut next = match index {
        Some(index) => assign(&record, &fields, index)?,
        None => advance(&record, &fields)?,
    };
    apply_overrides(&mut next, &fields, &overrides.pairs())?;

    let rows: Vec<SettingRow> = fields
        .iter()
        .map(|f| SettingRow {
            name: f.name.clone(),
            value: next.get(&f.name).unwrap_or_default().to_string(),
        })
        .collect();
    ctx.print(&rows);

    if write {
        next.save(file)
            .with_context(|| format!("Failed to write settings: {}", file.display()))?;
        ctx.success(&format!("Updated {}", file.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;

    const SETTINGS: &str = "\
key,type,encoding,value
settings,namespace,,
ip_sta,data,string,192.168.2.1
wifi_hostname,data,string,drone1
ssid_ap,data,string,DroneBridge1
";

    fn quiet() -> OutputContext {
        OutputContext::new(OutputFormat::Json, true, true)
    }

    #[test]
    fn test_sequence_write_assigns_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("user.csv");
        std::fs::write(&file, SETTINGS).unwrap();

        let overrides = Overrides {
            hostname: Some("bench"),
            ..Default::default()
        };
        sequence(&file, Some(5), &overrides, true, &quiet()).unwrap();

        let record = SettingsRecord::load(&file).unwrap();
        assert_eq!(record.get("ip_sta"), Some("192.168.2.5"));
        assert_eq!(record.get("wifi_hostname"), Some("bench"));
        assert_eq!(record.get("ssid_ap"), Some("DroneBridge5"));
    }

    #[test]
    fn test_sequence_write_quotes_line_breaks() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("user.csv");
        std::fs::write(&file, SETTINGS).unwrap();

        let overrides = Overrides {
            hostname: Some("two\nlines"),
            ..Default::default()
        };
        sequence(&file, None, &overrides, true, &quiet()).unwrap();

        let record = SettingsRecord::load(&file).unwrap();
        assert_eq!(record.get("wifi_hostname"), Some("two\nlines"));
        assert_eq!(record.get("ip_sta"), Some("192.168.2.2"));
    }

    #[test]
    fn test_sequence_without_write_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("user.csv");
        std::fs::write(&file, SETTINGS).unwrap();

        sequence(&file, None, &Overrides::default(), false, &quiet()).unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), SETTINGS);
    }

    #[test]
    fn test_sequence_rejects_bad_address() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("user.csv");
        std::fs::write(&file, SETTINGS).unwrap();

        let overrides = Overrides {
            ip: Some("192.168.2"),
            ..Default::default()
        };
        assert!(sequence(&file, None, &overrides, true, &quiet()).is_err());
        assert_eq!(std::fs::read_to_string(&file).unwrap(), SETTINGS);
    }
}
