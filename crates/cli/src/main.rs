//! usb-proxy
//!
//! Command-line client of the USB call proxy: lists attached devices and
//! probes a single device, with every USB call executed on the proxy's
//! worker thread.

mod commands;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::setup_logging;
use config::CliConfig;
use std::io;
use tracing::info;
use usbproxy::Session;

#[derive(Parser, Debug)]
#[command(name = "usb-proxy")]
#[command(author, version, about = "USB call proxy - single-threaded access to libusb")]
#[command(long_about = "
Runs every USB call on one dedicated worker thread and hands the results
back to the calling thread.

EXAMPLES:
    # List attached devices
    usb-proxy list

    # Same, as JSON
    usb-proxy list --json

    # Read strings and active configuration of one device
    usb-proxy probe 046d:c31c

    # Debug logging, including every proxied call
    usb-proxy --log-level trace list

CONFIGURATION:
    The configuration file is read from:
    1. Path specified with --config
    2. ~/.config/usb-proxy/config.toml
    3. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached USB devices
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Open a device and print its strings and active configuration
    Probe {
        /// Device to probe, as hex VID:PID
        #[arg(value_name = "VID:PID")]
        target: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Print the native library version
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let path = CliConfig::default_path();
        CliConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config {
        Some(path) => CliConfig::load(Some(path)).context("Failed to load configuration")?,
        None => CliConfig::load_or_default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-proxy v{}", env!("CARGO_PKG_VERSION"));

    let Some(command) = args.command else {
        println!("No command given; try `usb-proxy --help`");
        return Ok(());
    };

    let session = Session::builder().config(config.proxy).build();
    let mut out = io::stdout().lock();

    match command {
        Command::List { json } => commands::run_list(&session, json, &mut out),
        Command::Probe { target, json } => commands::run_probe(&session, &target, json, &mut out),
        Command::Version => {
            let v = usbproxy::version();
            println!("{} {}.{}.{}", v.describe, v.major, v.minor, v.micro);
            Ok(())
        }
    }
}
