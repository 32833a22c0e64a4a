//! Output formatting for provctl (table, json, csv)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Status line on stdout, suppressed by `--quiet`
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.green());
        }
    }

    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print rows in the configured format
    pub fn print<T: Tabled + Serialize>(&self, rows: &[T]) {
        match self.format {
            OutputFormat::Table if rows.is_empty() => {
                if !self.quiet {
                    println!("No data");
                }
            }
            OutputFormat::Table => println!("{}", Table::new(rows)),
            OutputFormat::Json => match serde_json::to_string_pretty(rows) {
                Ok(text) => println!("{}", text),
                Err(e) => self.error(&format!("Cannot encode output: {}", e)),
            },
            OutputFormat::Csv => {
                if let Err(e) = write_csv(rows) {
                    self.error(&format!("Cannot write CSV: {}", e));
                }
            }
        }
    }

    /// Print labelled values, one per line or as a single record
    pub fn print_kv(&self, pairs: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold(), value);
                }
            }
            OutputFormat::Json => {
                let map: serde_json::Map<String, serde_json::Value> = pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                    .collect();
                match serde_json::to_string_pretty(&map) {
                    Ok(text) => println!("{}", text),
                    Err(e) => self.error(&format!("Cannot encode output: {}", e)),
                }
            }
            OutputFormat::Csv => {
                if let Err(e) = write_kv_csv(pairs) {
                    self.error(&format!("Cannot write CSV: {}", e));
                }
            }
        }
    }
}

fn write_csv<T: Serialize>(rows: &[T]) -> csv::Result<()> {
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_kv_csv(pairs: &[(&str, String)]) -> csv::Result<()> {
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    writer.write_record(pairs.iter().map(|(k, _)| *k))?;
    writer.write_record(pairs.iter().map(|(_, v)| v.as_str()))?;
    writer.flush()?;
    Ok(())
}

// =============================================================================
// Display types for various commands
// =============================================================================

/// One provisioned device
#[derive(Debug, Tabled, Serialize)]
pub struct ProvisionRow {
    #[tabled(rename = "Port")]
    pub port: String,
    #[tabled(rename = "Device")]
    pub identity: String,
    #[tabled(rename = "Chip")]
    pub chip: String,
    #[tabled(rename = "IP")]
    pub ip: String,
    #[tabled(rename = "License")]
    pub license: String,
    #[tabled(rename = "Attempts")]
    pub attempts: u32,
}

/// One OTA target
#[derive(Debug, Tabled, Serialize)]
pub struct OtaRow {
    #[tabled(rename = "Target")]
    pub target: String,
    #[tabled(rename = "Outcome")]
    pub outcome: String,
}

/// One image region
#[derive(Debug, Tabled, Serialize)]
pub struct RegionRow {
    #[tabled(rename = "Region")]
    pub region: String,
    #[tabled(rename = "Content")]
    pub content: String,
    #[tabled(rename = "Offset")]
    pub offset: String,
    #[tabled(rename = "Used")]
    pub used: usize,
    #[tabled(rename = "Capacity")]
    pub capacity: u32,
}

/// One settings parameter
#[derive(Debug, Tabled, Serialize)]
pub struct SettingRow {
    #[tabled(rename = "Parameter")]
    pub name: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

/// One serial endpoint
#[derive(Debug, Tabled, Serialize)]
pub struct PortRow {
    #[tabled(rename = "Port")]
    pub port: String,
}
