//! # tunnel-cli
//!
//! Operator CLI for 0k-Tunnel.
//!
//! ## Commands
//!
//! - `init`: Create the instance identity and point it at a relay
//! - `serve`: Run the instance, print a claim code, echo over tunnels
//! - `pair`: Redeem a claim code and exchange messages
//! - `status`: Show identity and relay settings
//!
//! ## Example
//!
//! ```bash
//! # On the machine to reach
//! tunnel-cli init --relay ws://relay.example:8080 --name build-box
//! tunnel-cli serve
//!
//! # On the client, with the code serve printed
//! tunnel-cli pair ABCD-2345 --relay ws://relay.example:8080 -m hello
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{init, pair, serve, status};

/// Operator CLI for 0k-Tunnel.
#[derive(Parser, Debug)]
#[command(name = "tunnel-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for the instance identity and configuration
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the instance identity
    Init {
        /// Relay base URL (ws:// or wss://)
        #[arg(long, short)]
        relay: String,

        /// Instance name
        #[arg(long, short, default_value = "tunnel-instance")]
        name: String,
    },

    /// Connect to the relay and serve paired clients
    Serve {
        /// Claim code lifetime in seconds (relay default if omitted)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },

    /// Redeem a claim code and talk to the instance
    Pair {
        /// Claim code, with or without the dash
        code: String,

        /// Relay base URL (defaults to the one from init)
        #[arg(long, short)]
        relay: Option<String>,

        /// Device name shown to the instance
        #[arg(long, short)]
        name: Option<String>,

        /// Message to send (repeatable; reads stdin when omitted)
        #[arg(long = "message", short = 'm')]
        messages: Vec<String>,
    },

    /// Show instance status
    Status {
        /// Also check that the relay accepts connections
        #[arg(long)]
        check: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Determine data directory
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    // Ensure data directory exists
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;

    match cli.command {
        Commands::Init { relay, name } => {
            init::run(&data_dir, &relay, &name).await?;
        }
        Commands::Serve { ttl_secs } => {
            serve::run(&data_dir, ttl_secs).await?;
        }
        Commands::Pair {
            code,
            relay,
            name,
            messages,
        } => {
            pair::run(
                &data_dir,
                &code,
                relay.as_deref(),
                name.as_deref(),
                &messages,
            )
            .await?;
        }
        Commands::Status { check } => {
            status::run(&data_dir, check).await?;
        }
    }

    Ok(())
}

/// Get the default data directory for tunnel-cli.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "zerok", "tunnel-cli")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
