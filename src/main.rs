//! eBUS-to-TCP adapter binary entry point. See the `ebus_adapter` library
//! for the protocol engine and network surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ebus_adapter::arbitration_claim::ArbitrationClaim;
use ebus_adapter::bus::{self, Bus};
use ebus_adapter::config::Config;
use ebus_adapter::socket::fanout;
use ebus_adapter::socket::server::Server;

#[derive(Parser)]
#[command(name = "ebus-adapter")]
#[command(version)]
#[command(about = "eBUS-to-TCP protocol adapter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the adapter: open the serial port and serve the TCP ports.
    Serve {
        /// Path to a TOML config file (defaults to the platform config dir).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overrides `serial_port` from the loaded config.
        #[arg(long)]
        serial: Option<PathBuf>,
        /// Overrides `own_address` from the loaded config (hex, e.g. `0x31`).
        #[arg(long)]
        address: Option<String>,
        /// Overrides `raw_port` from the loaded config.
        #[arg(long)]
        raw_port: Option<u16>,
        /// Overrides `raw_ro_port` from the loaded config.
        #[arg(long)]
        raw_ro_port: Option<u16>,
        /// Overrides `enhanced_port` from the loaded config.
        #[arg(long)]
        enhanced_port: Option<u16>,
        /// Overrides `status_port` from the loaded config.
        #[arg(long)]
        status_port: Option<u16>,
    },
    /// Print the effective configuration as TOML and exit.
    PrintConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_logging() {
    let log_path = if let Ok(path) = std::env::var("EBUS_ADAPTER_LOG_FILE") {
        PathBuf::from(path)
    } else if ebus_adapter::Environment::current().is_test() {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/ebus-adapter.log")
    } else {
        PathBuf::from("/tmp/ebus-adapter.log")
    };
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(log_file) = std::fs::File::create(&log_path) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .target(env_logger::Target::Pipe(Box::new(log_file)))
            .format_timestamp_secs()
            .init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .init();
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_path(&path),
        None => Config::load(),
    }
}

fn parse_hex_address(s: &str) -> Result<u8> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(trimmed, 16).with_context(|| format!("invalid address: {s}"))
}

async fn serve(
    config_path: Option<PathBuf>,
    serial: Option<PathBuf>,
    address: Option<String>,
    raw_port: Option<u16>,
    raw_ro_port: Option<u16>,
    enhanced_port: Option<u16>,
    status_port: Option<u16>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(serial) = serial {
        config.serial_port = serial;
    }
    if let Some(address) = address {
        config.own_address = parse_hex_address(&address)?;
    }
    if let Some(port) = raw_port {
        config.raw_port = port;
    }
    if let Some(port) = raw_ro_port {
        config.raw_ro_port = port;
    }
    if let Some(port) = enhanced_port {
        config.enhanced_port = port;
    }
    if let Some(port) = status_port {
        config.status_port = port;
    }
    config.validate()?;

    log::info!(
        "starting eBUS adapter: serial={} own_address={:#04x}",
        config.serial_port.display(),
        config.own_address
    );

    let (serial_read, serial_write) =
        bus::open_serial(&config.serial_port.to_string_lossy(), config.baud_rate)?;

    let claim = Arc::new(ArbitrationClaim::new());
    let (fanout_tx, fanout_rx) = fanout::channel();
    let bus = Bus::new(claim, fanout_tx);
    let (command_tx, command_rx) = tokio::sync::mpsc::unbounded_channel();

    let server = Server::start(&config, &bus, command_tx, fanout_rx).await?;

    let notify = Arc::new(tokio::sync::Notify::new());
    let ctrlc_notify = notify.clone();
    ctrlc::set_handler(move || {
        log::info!("received shutdown signal");
        ctrlc_notify.notify_one();
    })
    .context("failed to install Ctrl-C handler")?;

    tokio::select! {
        () = bus::run(bus, serial_read, serial_write, command_rx) => {
            log::error!("bus task exited unexpectedly");
        }
        () = notify.notified() => {
            log::info!("shutting down");
        }
    }

    server.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            serial,
            address,
            raw_port,
            raw_ro_port,
            enhanced_port,
            status_port,
        } => {
            serve(
                config,
                serial,
                address,
                raw_port,
                raw_ro_port,
                enhanced_port,
                status_port,
            )
            .await?;
        }
        Commands::PrintConfig { config } => {
            let config = load_config(config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
