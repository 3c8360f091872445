//! CA350 bridge CLI.
//!
//! Connects to the serial gateway, writes telemetry to stdout as JSON lines
//! and reads commands from stdin as JSON lines. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Default gateway 192.168.40.130:8899
//! ca350-bridge
//!
//! # Custom gateway, verbose logs
//! ca350-bridge --host 10.0.0.7 --port 23 --log-level debug
//!
//! # Using a configuration file
//! ca350-bridge --config ca350.json
//!
//! # Print the default configuration
//! ca350-bridge gen-config
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use comfoair_bridge::bridge::{publish_telemetry, read_commands};
use comfoair_bridge::{BridgeConfig, ClientBuilder};
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// ComfoAir CA350 bridge
#[derive(Parser, Debug)]
#[command(name = "ca350-bridge")]
#[command(about = "ComfoAir CA350 bridge - telemetry and verified commands over stdio")]
#[command(version)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Gateway host (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Gateway port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the default configuration as JSON
    GenConfig,
    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // stdout carries telemetry, so logs go to stderr
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig => {
                println!("{}", serde_json::to_string_pretty(&BridgeConfig::default())?);
                Ok(())
            }
            Commands::Validate { config } => {
                BridgeConfig::load(&config)?;
                info!("{} is valid", config.display());
                Ok(())
            }
        };
    }

    let mut config = match args.config {
        Some(ref path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    info!("CA350 bridge v{}", env!("CARGO_PKG_VERSION"));

    let client = ClientBuilder::from_config(config).start().await?;

    let (replay, telemetry) = client.subscribe_with_snapshot();
    let output = tokio::spawn(publish_telemetry(replay, telemetry, tokio::io::stdout()));
    let executor = client.executor();
    let input = tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = read_commands(stdin, &executor).await {
            error!("Command input failed: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    input.abort();
    client.shutdown().await;
    output.abort();

    for command in client.seen_commands() {
        info!("CMD {:02X} {:02X}", command >> 8, command & 0xFF);
    }
    info!("Shutdown complete");

    Ok(())
}
