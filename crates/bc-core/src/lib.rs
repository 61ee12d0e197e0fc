//! Beacon Core Library
//!
//! This crate provides the connection front end of a Beacon swarm node.
//! It includes:
//! - TCP and QUIC listeners bound to one shared port
//! - Identity handshake on every inbound and outbound socket
//! - Connection accounting and deterministic shutdown
//! - Topic membership through a pluggable discovery backend

pub mod brand;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;

pub use config::{BackendConfig, BeaconConfig, Options};
pub use error::{BeaconError, HandshakeError, Result};
pub use network::{
    Beacon, BeaconEvent, Connection, ConnectionInfo, EventReceiver, JoinOptions,
    MemoryDiscovery, PeerId, PeerIdentity, Topic, TransportKind,
};
