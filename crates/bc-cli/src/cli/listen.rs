//! Listen Command Implementation

use anyhow::Result;
use bc_core::{Beacon, BeaconConfig, BeaconEvent, JoinOptions, MemoryDiscovery, Options};
use tracing::{info, warn};

/// Run the listen command
pub async fn run(
    config: BeaconConfig,
    port: Option<u16>,
    topics: Vec<String>,
    no_tcp: bool,
    no_quic: bool,
) -> Result<()> {
    let port = port.unwrap_or(config.listen_port);
    let tcp = config.tcp && !no_tcp;
    let quic = config.quic && !no_quic;
    let config = config.with_tcp(tcp).with_quic(quic);

    let mut options = Options::new(config);
    if !topics.is_empty() {
        options = options.with_discovery(MemoryDiscovery::new());
    }

    let (beacon, mut events) = Beacon::new(options)?;
    let addr = match beacon.listen(port).await {
        Ok(addr) => addr,
        Err(e) => {
            beacon.destroy().await;
            return Err(e.into());
        }
    };

    println!();
    println!("Beacon listening on {}", addr);
    println!("  Peer ID:    {}", beacon.local_id());
    println!("  Transports: tcp={} quic={}", tcp, quic);
    println!();

    for topic in &topics {
        beacon.join(topic.as_str(), JoinOptions::default()).await?;
        println!("Joined topic {}", topic);
    }

    // Connections close when dropped, so keep them for the session
    let mut connections = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(BeaconEvent::Connection(connection, info)) => {
                    let peer = info
                        .id
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "<anonymous>".to_string());
                    println!(
                        "{} {} {}:{} {} ({} connected)",
                        if info.initiator { "->" } else { "<-" },
                        info.kind,
                        info.host,
                        info.port,
                        peer,
                        beacon.connected(),
                    );
                    connections.push(connection);
                }
                Some(BeaconEvent::Error(e)) => warn!("{}", e),
                Some(BeaconEvent::Listening(_)) => {}
                Some(BeaconEvent::Close) | None => break,
            },
        }
    }

    beacon.destroy().await;
    drop(connections);
    println!("Closed");
    Ok(())
}
