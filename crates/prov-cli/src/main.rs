//! provctl - Command-line tool for license activation and firmware provisioning
//!
//! Derives activation keys, obtains licenses, prepares settings, composes
//! flash images and delivers them over serial or to networked devices.

mod commands;
mod config;
mod output;

use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use prov_core::{AccountToken, TargetSet};
use prov_delivery::{DeviceApiClient, SerialIdentityResolver};
use prov_pipeline::WatchConfig;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::settings::Overrides;
use crate::config::{Config, MergedConfig};
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "provctl")]
#[command(author, version, about = "License activation and firmware provisioning")]
#[command(propagate_version = true)]
struct Cli {
    /// Provisioning run configuration (TOML)
    #[arg(short, long, env = "PROV_CONFIG")]
    config: Option<PathBuf>,

    /// Account token, overrides the run configuration
    #[arg(long, env = "PROV_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Output format
    #[arg(short, long, value_enum)]
    output: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Also write the log to provisioning_<timestamp>.log in this folder
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive the activation key of a device
    Key {
        /// Device identity (MAC, e.g. 24:0a:c4:12:34:56)
        identity: String,
    },

    /// List attached serial ports
    Ports,

    /// Read identity and installed license of a device
    Identify {
        /// Serial port
        #[arg(short, long)]
        port: String,
    },

    /// License authority requests
    License {
        #[command(subcommand)]
        command: LicenseCommand,
    },

    /// Settings file tools
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },

    /// Compose a device image without flashing it
    Compose {
        /// Device identity
        identity: String,

        /// Chip variant, e.g. esp32c5
        #[arg(long)]
        chip: String,

        /// Raw license blob; defaults to the local license store
        #[arg(long)]
        license_file: Option<PathBuf>,

        /// Explicit device index for the sequenced parameters
        #[arg(long)]
        index: Option<u32>,

        /// Image output path
        #[arg(long)]
        out: PathBuf,
    },

    /// Check a firmware release is complete
    CheckRelease {
        /// Chip variant
        #[arg(long)]
        chip: String,

        /// Release folder; defaults to the run configuration's
        release_dir: Option<PathBuf>,
    },

    /// Provision the device on a serial port
    Provision {
        /// Serial port
        #[arg(short, long)]
        port: String,

        /// Explicit device index for the sequenced parameters
        #[arg(long)]
        index: Option<u32>,
    },

    /// Provision devices as they are plugged in
    Watch {
        /// Port scan interval in milliseconds
        #[arg(long, default_value = "1000")]
        poll_ms: u64,

        /// Delay before opening a new port in milliseconds
        #[arg(long, default_value = "2000")]
        settle_ms: u64,

        /// Also provision devices attached before startup
        #[arg(long)]
        include_existing: bool,
    },

    /// Update networked devices over the air
    Ota {
        /// Targets: addresses, ranges (192.168.4.1-20) or CIDR blocks, comma separated
        targets: TargetSet,

        /// Chip variant of the release to deliver
        #[arg(long)]
        chip: String,
    },

    /// Device settings web API
    DeviceApi {
        /// Web server port of the device
        #[arg(long, default_value = "80")]
        http_port: u16,

        /// Request timeout in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,

        #[command(subcommand)]
        command: DeviceApiCommand,
    },
}

#[derive(Subcommand)]
enum LicenseCommand {
    /// Request a license from the authority
    Request {
        /// Device identity
        #[arg(required_unless_present = "key")]
        identity: Option<String>,

        /// Activation key (hex) instead of a device identity
        #[arg(long)]
        key: Option<String>,
    },

    /// Check the authority is reachable
    Check,
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Merge user settings into release settings
    Merge {
        /// Release settings file
        release: PathBuf,

        /// User settings file
        user: PathBuf,
    },

    /// Show the next device's parameters
    Sequence {
        /// Settings file
        file: PathBuf,

        /// Assign from this device index instead of advancing by one
        #[arg(long)]
        index: Option<u32>,

        /// Station address
        #[arg(long)]
        ip: Option<String>,

        /// WiFi hostname
        #[arg(long)]
        hostname: Option<String>,

        /// Access point name
        #[arg(long)]
        ssid_ap: Option<String>,

        /// Write the values back to the file
        #[arg(long)]
        write: bool,
    },
}

#[derive(Subcommand)]
enum DeviceApiCommand {
    /// Add a UDP telemetry client
    UdpClient {
        device: IpAddr,
        client_ip: IpAddr,
        client_port: u16,

        /// Persist the client across reboots
        #[arg(long)]
        save: bool,
    },

    /// Set a static station address
    StaticIp {
        device: IpAddr,
        ip: IpAddr,
        netmask: IpAddr,
        gateway: IpAddr,
    },

    /// Switch back to DHCP
    Dhcp { device: IpAddr },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config file
    let config = Config::load().unwrap_or_default();
    let merged = config.merge_with_args(cli.config.as_deref(), cli.log_dir.as_deref(), cli.no_color);

    init_logging(cli.verbose, merged.log_dir.as_deref())?;

    let format = cli
        .output
        .or_else(|| {
            config
                .output
                .as_deref()
                .and_then(|s| OutputFormat::from_str(s, true).ok())
        })
        .unwrap_or_default();
    let ctx = OutputContext::new(format, merged.no_color, cli.quiet);

    if let Err(e) = run(&cli, &merged, &ctx).await {
        ctx.error(&format!("Error: {:#}", e));
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: &Cli, merged: &MergedConfig, ctx: &OutputContext) -> Result<()> {
    debug!(run_config = %merged.run_config.display(), "Resolved configuration");
    match &cli.command {
        Commands::Key { identity } => {
            let token = resolve_token(cli.token.as_deref(), &merged.run_config)?;
            commands::key(identity, &token, ctx)?;
        }

        Commands::Ports => {
            let run_config = commands::load_run_config(&merged.run_config)?;
            let connector = commands::serial_connector(&run_config)?;
            commands::ports(connector.as_ref(), ctx).await?;
        }

        Commands::Identify { port } => {
            let run_config = commands::load_run_config(&merged.run_config)?;
            let connector = commands::serial_connector(&run_config)?;
            let resolver = SerialIdentityResolver::new(connector, &run_config.serial);
            commands::identify(&resolver, port, ctx).await?;
        }

        Commands::License { command } => {
            let run_config = commands::load_run_config(&merged.run_config)?;
            let token = commands::account_token(&run_config, cli.token.as_deref())?;
            let client = commands::license_client(&run_config, token.clone())?;
            match command {
                LicenseCommand::Request { identity, key } => {
                    commands::license_request(&client, &token, identity.as_deref(), key.as_deref(), ctx)
                        .await?;
                }
                LicenseCommand::Check => commands::license_check(&client, ctx).await?,
            }
        }

        Commands::Settings { command } => match command {
            SettingsCommand::Merge { release, user } => commands::merge(release, user, ctx)?,
            SettingsCommand::Sequence {
                file,
                index,
                ip,
                hostname,
                ssid_ap,
                write,
            } => {
                let overrides = Overrides {
                    ip: ip.as_deref(),
                    hostname: hostname.as_deref(),
                    ssid_ap: ssid_ap.as_deref(),
                };
                commands::sequence(file, *index, &overrides, *write, ctx)?;
            }
        },

        Commands::Compose {
            identity,
            chip,
            license_file,
            index,
            out,
        } => {
            let run_config = commands::load_run_config(&merged.run_config)?;
            let token = commands::account_token(&run_config, cli.token.as_deref())?;
            commands::compose(
                &run_config,
                &token,
                identity,
                chip,
                license_file.as_deref(),
                *index,
                out,
                ctx,
            )?;
        }

        Commands::CheckRelease { chip, release_dir } => {
            let dir = match release_dir {
                Some(dir) => dir.clone(),
                None => commands::load_run_config(&merged.run_config)?.image.release_dir,
            };
            commands::check_release(&dir, chip, ctx)?;
        }

        Commands::Provision { port, index } => {
            let run_config = commands::load_run_config(&merged.run_config)?;
            let token = commands::account_token(&run_config, cli.token.as_deref())?;
            let (provisioner, _) = commands::provisioner(&run_config, token)?;
            commands::provision(&provisioner, port, *index, ctx).await?;
        }

        Commands::Watch {
            poll_ms,
            settle_ms,
            include_existing,
        } => {
            let run_config = commands::load_run_config(&merged.run_config)?;
            let token = commands::account_token(&run_config, cli.token.as_deref())?;
            let (provisioner, connector) = commands::provisioner(&run_config, token)?;
            let watch = WatchConfig {
                poll_interval: Duration::from_millis(*poll_ms),
                settle_delay: Duration::from_millis(*settle_ms),
                ignore_existing: !include_existing,
            };
            commands::watch(provisioner, connector, watch, ctx).await?;
        }

        Commands::Ota { targets, chip } => {
            let run_config = commands::load_run_config(&merged.run_config)?;
            commands::ota(&run_config, targets, chip, ctx).await?;
        }

        Commands::DeviceApi {
            http_port,
            timeout_ms,
            command,
        } => {
            let client = DeviceApiClient::new("http", *http_port, Duration::from_millis(*timeout_ms))
                .context("Failed to create device API client")?;
            match command {
                DeviceApiCommand::UdpClient {
                    device,
                    client_ip,
                    client_port,
                    save,
                } => {
                    commands::add_udp_client(&client, *device, *client_ip, *client_port, *save, ctx)
                        .await?
                }
                DeviceApiCommand::StaticIp {
                    device,
                    ip,
                    netmask,
                    gateway,
                } => commands::set_static_ip(&client, *device, *ip, *netmask, *gateway, ctx).await?,
                DeviceApiCommand::Dhcp { device } => {
                    commands::reset_static_ip(&client, *device, ctx).await?
                }
            }
        }
    }

    Ok(())
}

/// Token from the command line, else from the run configuration
fn resolve_token(token: Option<&str>, run_config: &Path) -> Result<AccountToken> {
    match token {
        Some(token) => AccountToken::new(token).context("Invalid account token"),
        None => {
            let run_config = commands::load_run_config(run_config)?;
            commands::account_token(&run_config, None)
        }
    }
}

/// Console logging plus an optional per-run log file
fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log folder: {}", dir.display()))?;
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            let path = dir.join(format!("provisioning_{}.log", stamp));
            let file = File::create(&path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .with(filter)
        .init();
    Ok(())
}
