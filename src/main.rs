//! XBee Loader - find Propeller boards behind XBee WiFi modules and load images onto them.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use xbee_loader as app;

use app::AppError;
use app::config::{AppConfig, ConfigLoadResult};
use app::device::DeviceRecord;
use app::discovery::Scanner;
use app::events::{LoadEvent, LoadOutcome};
use app::loader::{Destination, Loader};

/// Find Propeller boards behind XBee WiFi modules and load images onto them.
#[derive(Parser)]
#[command(name = "xbee-loader", version)]
struct Cli {
    /// Use config.toml from current directory (dev mode)
    #[arg(long)]
    dev: bool,

    /// Config file to use instead of the default location
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Find XBee modules on the subnet
    Scan {
        /// Subnet to probe, e.g. 192.168.1.0/24 (defaults to the configured one)
        #[arg(long)]
        subnet: Option<String>,

        /// Print the devices as JSON
        #[arg(long)]
        json: bool,
    },
    /// Read the node identifier of a module
    Name {
        /// Module IP address
        ip: Ipv4Addr,
    },
    /// Load a binary image onto a board
    Load {
        /// Image file
        image: PathBuf,

        /// Module IP address
        #[arg(long)]
        ip: Ipv4Addr,

        /// Serial service port (defaults to the configured one)
        #[arg(long)]
        port: Option<u16>,

        /// Program EEPROM instead of RAM
        #[arg(long)]
        eeprom: bool,

        /// Maximum reset cycles (defaults to the configured limit)
        #[arg(long)]
        attempts: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            exit_code(&e)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None if cli.dev => {
            tracing::info!("Dev mode: loading config from current directory");
            PathBuf::from("config.toml")
        }
        None => AppConfig::default_path(),
    };
    tracing::info!("Config path: {:?}", config_path);

    let config = match AppConfig::try_load(&config_path) {
        ConfigLoadResult::Loaded(config) => {
            tracing::info!("Config loaded successfully");
            config
        }
        ConfigLoadResult::Missing => {
            tracing::info!("Config missing, using defaults");
            AppConfig::default()
        }
        ConfigLoadResult::Invalid(e) => {
            return Err(AppError::from(e)).with_context(|| format!("Cannot use {}", config_path.display()));
        }
    };

    match cli.command {
        Command::Scan { subnet, json } => {
            let subnet = subnet.unwrap_or_else(|| config.network.subnet.clone());
            let devices = run_scan(&config, &subnet).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No devices found on {subnet}");
            } else {
                for device in &devices {
                    println!("{device}");
                }
            }
        }
        Command::Name { ip } => {
            let name = run_name(&config, ip).await?;
            println!("{name}");
        }
        Command::Load {
            image,
            ip,
            port,
            eeprom,
            attempts,
        } => {
            let device = DeviceRecord::from_address(ip, port.unwrap_or(config.network.serial_port));
            let destination = if eeprom { Destination::Eeprom } else { Destination::Ram };
            let attempts = attempts.unwrap_or(config.loader.max_attempts);
            run_load(&config, &image, device, destination, attempts)
                .await
                .with_context(|| format!("Loading {} failed", image.display()))?;
        }
    }

    Ok(())
}

/// Scan a subnet with the configured ports and window.
async fn run_scan(config: &AppConfig, subnet: &str) -> app::Result<Vec<DeviceRecord>> {
    let scanner = Scanner::from(&config.network);
    let devices = scanner
        .scan(subnet, config.network.command_port, config.network.serial_port)
        .await?;
    Ok(devices)
}

/// Query one module's node identifier.
async fn run_name(config: &AppConfig, ip: Ipv4Addr) -> app::Result<String> {
    let scanner = Scanner::from(&config.network);
    let device = DeviceRecord::from_address(ip, config.network.serial_port);
    let name = scanner.device_name(&device, config.network.command_port).await?;
    Ok(name)
}

/// Load an image file and follow the load until it ends. Ctrl-C cancels.
async fn run_load(
    config: &AppConfig,
    image: &Path,
    device: DeviceRecord,
    destination: Destination,
    attempts: u32,
) -> app::Result<()> {
    let bytes = tokio::fs::read(image).await?;
    let target = device.to_string();

    let loader = Loader::new(config.network.command_port, config.loader.clone());
    let handle = loader.load(bytes, destination, device, attempts)?;

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling load");
            cancel.cancel();
        }
    });

    let outcome = handle
        .wait_with(|event| match event {
            LoadEvent::Status(status) => tracing::info!("{status}"),
            LoadEvent::Progress(progress) => tracing::info!("Progress: {:.0}%", progress * 100.0),
            LoadEvent::ChecksumFailure => tracing::warn!("Checksum mismatch"),
            LoadEvent::AttemptFailed { attempts_remaining } => {
                tracing::warn!("Attempt failed, {attempts_remaining} left")
            }
            _ => {}
        })
        .await;

    match outcome {
        LoadOutcome::Complete => {
            println!("Loaded {} into {destination} of {target}", image.display());
            Ok(())
        }
        LoadOutcome::Failed(e) => Err(e.into()),
        LoadOutcome::Cancelled => Err(AppError::Cancelled),
    }
}

/// Process exit code: the loader's fatal error code where there is one, 1 otherwise.
fn exit_code(error: &anyhow::Error) -> ExitCode {
    let code = match error.downcast_ref::<AppError>() {
        Some(AppError::Loader(e)) => e.code().unwrap_or(1),
        Some(AppError::Cancelled) => 130,
        _ => 1,
    };
    ExitCode::from(code as u8)
}
