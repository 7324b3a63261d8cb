use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;

mod config;
mod scenario;

use config::{FileConfig, Profile, load_config};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Private payload exchange between two in-process relay nodes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding relay.toml (defaults to the current directory)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Timing preset, overrides the profile in relay.toml
    #[arg(long, global = true, value_enum)]
    profile: Option<Profile>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Leader sends then receives, follower receives then sends
    Exchange {
        /// Receive timeout in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },

    /// Open a connection and bounce a payload back and forth
    PingPong {
        #[arg(long, default_value = "100", value_parser = clap::value_parser!(u32).range(1..))]
        rounds: u32,

        /// Payload size in bytes
        #[arg(long, default_value = "1024", value_parser = clap::value_parser!(u32).range(1..))]
        size: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "relay=debug,session_relay=debug,info"
    } else {
        "relay=info,session_relay=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let file: FileConfig = load_config(&config_dir, cli.profile.as_ref())
        .extract()
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;
    info!(profile = ?file.profile, dir = %config_dir.display(), "configuration loaded");

    let relay = file.relay.to_relay_config();
    let connection = file.connection.to_connection_config();

    match cli.command {
        Commands::Exchange { timeout_ms } => {
            scenario::exchange(&relay, Duration::from_millis(timeout_ms)).await
        }
        Commands::PingPong { rounds, size } => {
            let elapsed = scenario::ping_pong(&relay, &connection, rounds, size as usize).await?;
            println!(
                "{rounds} rounds of {size} bytes in {elapsed:?} ({:?} per round trip)",
                elapsed / rounds
            );
            Ok(())
        }
    }
}
