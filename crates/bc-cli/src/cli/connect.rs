//! Connect Command Implementation

use anyhow::{bail, Result};
use bc_core::protocol::HANDSHAKE_TIMEOUT;
use bc_core::{Beacon, BeaconConfig, BeaconEvent, ConnectionInfo, EventReceiver, Options, TransportKind};
use std::net::SocketAddr;
use tracing::warn;

/// Run the connect command
pub async fn run(config: BeaconConfig, addr: SocketAddr, quic: bool) -> Result<()> {
    let kind = if quic {
        TransportKind::Quic
    } else {
        TransportKind::Tcp
    };
    let config = if quic { config.with_quic(true) } else { config };

    let (beacon, mut events) = Beacon::new(Options::new(config))?;
    let outcome = dial(&beacon, &mut events, addr, kind).await;
    beacon.destroy().await;

    let info = outcome?;
    println!();
    println!("Connected to {} over {}", addr, info.kind);
    match &info.id {
        Some(id) => println!("  Peer ID: {}", id),
        None => println!("  Peer ID: <none>"),
    }
    println!("  Local ID: {}", beacon.local_id());
    println!();
    Ok(())
}

async fn dial(
    beacon: &Beacon,
    events: &mut EventReceiver,
    addr: SocketAddr,
    kind: TransportKind,
) -> Result<ConnectionInfo> {
    beacon.connect(addr, kind).await?;

    let handshake = async {
        while let Some(event) = events.recv().await {
            match event {
                BeaconEvent::Connection(_connection, info) => return Some(info),
                BeaconEvent::Error(e) => warn!("{}", e),
                _ => {}
            }
        }
        None
    };

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Some(info)) => Ok(info),
        _ => bail!("Handshake with {} did not complete", addr),
    }
}
