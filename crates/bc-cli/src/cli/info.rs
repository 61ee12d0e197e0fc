//! Info Command Implementation

use anyhow::Result;
use bc_core::{brand, BeaconConfig};
use std::path::PathBuf;

/// Run the info command
pub fn run(config: BeaconConfig, config_path: PathBuf) -> Result<()> {
    let id = config.resolve_identity()?;

    println!();
    println!("{} Info", brand::PRODUCT_NAME);
    println!("  {}", brand::DESCRIPTION);
    println!("  Peer ID:       {}", id);
    if let Some(path) = &config.identity_path {
        println!("  Identity Path: {}", path.display());
    }
    println!("  Config Path:   {}", config_path.display());
    println!("  Listen Port:   {}", config.listen_port);
    println!("  Transports:    tcp={} quic={}", config.tcp, config.quic);
    println!();

    Ok(())
}
