//! CLI Command Definitions
//!
//! Defines the command-line interface using clap.

pub mod connect;
pub mod info;
pub mod listen;

use anyhow::{Context, Result};
use bc_core::BeaconConfig;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Beacon - topic-based peer connections
///
/// Listens on TCP and QUIC at one port, exchanges identities with every
/// peer and keeps track of live connections.
#[derive(Parser, Debug)]
#[command(name = "beacon")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, value_name = "FILE", env = "BEACON_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Listen for peers
    ///
    /// Binds both transports to one port and prints every peer that
    /// completes the handshake. Stops on Ctrl-C.
    #[command(visible_alias = "l")]
    Listen {
        /// Port to bind (0 or omitted = configured port)
        #[arg(short, long, value_name = "PORT")]
        port: Option<u16>,

        /// Topic to join, may be repeated
        #[arg(short, long = "topic", value_name = "TOPIC")]
        topics: Vec<String>,

        /// Disable the TCP transport
        #[arg(long)]
        no_tcp: bool,

        /// Disable the QUIC transport
        #[arg(long)]
        no_quic: bool,
    },

    /// Connect to a peer directly
    ///
    /// Dials the address, waits for the handshake and prints the peer.
    #[command(visible_alias = "c")]
    Connect {
        /// Address of the peer, host:port
        #[arg(value_name = "ADDR")]
        addr: SocketAddr,

        /// Dial over QUIC instead of TCP
        #[arg(long)]
        quic: bool,
    },

    /// Show node information
    ///
    /// Displays the local peer ID and configuration paths.
    #[command(visible_alias = "i")]
    Info,
}

/// Load the configuration the CLI runs with, and where it came from
pub fn load_config(path: Option<&Path>) -> Result<(BeaconConfig, PathBuf)> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(BeaconConfig::default_config_path);
    let mut config = BeaconConfig::load_or_default(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    // The CLI keeps one identity across runs
    if config.identity_path.is_none() {
        config.identity_path = Some(BeaconConfig::default_identity_path());
    }
    Ok((config, path))
}
