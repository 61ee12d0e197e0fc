//! Beacon CLI
//!
//! Command-line interface for the Beacon connection manager.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let (config, config_path) = cli::load_config(cli.config.as_deref())?;

    // Execute command
    match cli.command {
        Commands::Listen {
            port,
            topics,
            no_tcp,
            no_quic,
        } => {
            cli::listen::run(config, port, topics, no_tcp, no_quic).await?;
        }
        Commands::Connect { addr, quic } => {
            cli::connect::run(config, addr, quic).await?;
        }
        Commands::Info => {
            cli::info::run(config, config_path)?;
        }
    }

    Ok(())
}
