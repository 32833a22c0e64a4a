//! Configuration file handling for provctl

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-user defaults for the CLI tool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default provisioning run configuration
    pub run_config: Option<PathBuf>,
    /// Default output format
    pub output: Option<String>,
    /// Disable colored output
    pub no_color: Option<bool>,
    /// Folder run logs are written to
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("provctl");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    pub fn merge_with_args(
        &self,
        run_config: Option<&Path>,
        log_dir: Option<&Path>,
        no_color: bool,
    ) -> MergedConfig {
        MergedConfig {
            run_config: run_config
                .map(Path::to_path_buf)
                .or_else(|| self.run_config.clone())
                .unwrap_or_else(|| PathBuf::from("provision.toml")),
            log_dir: log_dir.map(Path::to_path_buf).or_else(|| self.log_dir.clone()),
            no_color: no_color || self.no_color.unwrap_or(false),
        }
    }
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone)]
pub struct MergedConfig {
    pub run_config: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub no_color: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_file_values() {
        let config: Config = toml::from_str(
            "run_config = \"/etc/provctl/run.toml\"\nno_color = true\nlog_dir = \"/var/log/provctl\"\n",
        )
        .unwrap();

        let merged = config.merge_with_args(None, None, false);
        assert_eq!(merged.run_config, PathBuf::from("/etc/provctl/run.toml"));
        assert_eq!(merged.log_dir, Some(PathBuf::from("/var/log/provctl")));
        assert!(merged.no_color);

        let merged = config.merge_with_args(Some(Path::new("bench.toml")), Some(Path::new("logs")), false);
        assert_eq!(merged.run_config, PathBuf::from("bench.toml"));
        assert_eq!(merged.log_dir, Some(PathBuf::from("logs")));
    }

    #[test]
    fn test_defaults_without_file() {
        let merged = Config::default().merge_with_args(None, None, false);
        assert_eq!(merged.run_config, PathBuf::from("provision.toml"));
        assert_eq!(merged.log_dir, None);
        assert!(!merged.no_color);
    }
}
