//! Error types for Beacon
//!
//! Provides a unified error handling strategy using thiserror.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for Beacon operations
pub type Result<T> = std::result::Result<T, BeaconError>;

/// Unified error type for all Beacon operations
#[derive(Error, Debug)]
pub enum BeaconError {
    // ─────────────────────────────────────────────────────────────
    // Lifecycle Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Beacon has been destroyed")]
    Destroyed,

    #[error("No transport is enabled")]
    NoTransports,

    #[error("Transport {0} is not enabled")]
    TransportDisabled(crate::network::TransportKind),

    // ─────────────────────────────────────────────────────────────
    // Listener Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to bind {kind} listener to port {port}: {reason}")]
    PortBindFailed {
        kind: crate::network::TransportKind,
        port: u16,
        reason: String,
    },

    #[error("Could not bind both transports to one ephemeral port after {attempts} attempts")]
    BindRetriesExhausted { attempts: u32 },

    #[error("Accept error on {kind} listener: {reason}")]
    AcceptFailed {
        kind: crate::network::TransportKind,
        reason: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Dial to {addr} failed: {reason}")]
    DialFailed { addr: SocketAddr, reason: String },

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    // ─────────────────────────────────────────────────────────────
    // Discovery Errors
    // ─────────────────────────────────────────────────────────────
    #[error("No discovery backend is configured")]
    DiscoveryUnavailable,

    #[error("Discovery error: {0}")]
    Discovery(String),

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid peer ID: {0}")]
    InvalidPeerId(String),

    #[error("Transport setup failed: {0}")]
    TransportSetup(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while exchanging identity frames
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Connection closed before the handshake completed")]
    Closed,

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Unsigned varint error: {0}")]
    UnsignedVarint(#[from] unsigned_varint::decode::Error),

    #[error("Handshake timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for HandshakeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => HandshakeError::Closed,
            _ => HandshakeError::Io(err),
        }
    }
}

impl BeaconError {
    /// Copy of this error for an additional recipient.
    ///
    /// I/O sources keep their kind and message but lose their inner source.
    pub(crate) fn replicate(&self) -> BeaconError {
        match self {
            BeaconError::Destroyed => BeaconError::Destroyed,
            BeaconError::NoTransports => BeaconError::NoTransports,
            BeaconError::TransportDisabled(kind) => BeaconError::TransportDisabled(*kind),
            BeaconError::PortBindFailed { kind, port, reason } => BeaconError::PortBindFailed {
                kind: *kind,
                port: *port,
                reason: reason.clone(),
            },
            BeaconError::BindRetriesExhausted { attempts } => {
                BeaconError::BindRetriesExhausted { attempts: *attempts }
            }
            BeaconError::AcceptFailed { kind, reason } => BeaconError::AcceptFailed {
                kind: *kind,
                reason: reason.clone(),
            },
            BeaconError::DialFailed { addr, reason } => BeaconError::DialFailed {
                addr: *addr,
                reason: reason.clone(),
            },
            BeaconError::Handshake(e) => BeaconError::Handshake(e.replicate()),
            BeaconError::DiscoveryUnavailable => BeaconError::DiscoveryUnavailable,
            BeaconError::Discovery(msg) => BeaconError::Discovery(msg.clone()),
            BeaconError::ConfigError(msg) => BeaconError::ConfigError(msg.clone()),
            BeaconError::InvalidPeerId(msg) => BeaconError::InvalidPeerId(msg.clone()),
            BeaconError::TransportSetup(msg) => BeaconError::TransportSetup(msg.clone()),
            BeaconError::Io(e) => BeaconError::Io(copy_io(e)),
        }
    }
}

impl HandshakeError {
    fn replicate(&self) -> HandshakeError {
        match self {
            HandshakeError::Closed => HandshakeError::Closed,
            HandshakeError::FrameTooLarge { len, max } => HandshakeError::FrameTooLarge {
                len: *len,
                max: *max,
            },
            HandshakeError::UnsignedVarint(e) => HandshakeError::UnsignedVarint(e.clone()),
            HandshakeError::Timeout => HandshakeError::Timeout,
            HandshakeError::Io(e) => HandshakeError::Io(copy_io(e)),
        }
    }
}

fn copy_io(err: &std::io::Error) -> std::io::Error {
    std::io::Error::new(err.kind(), err.to_string())
}

impl From<toml::de::Error> for BeaconError {
    fn from(err: toml::de::Error) -> Self {
        BeaconError::ConfigError(err.to_string())
    }
}

impl From<toml::ser::Error> for BeaconError {
    fn from(err: toml::ser::Error) -> Self {
        BeaconError::ConfigError(err.to_string())
    }
}

impl From<hex::FromHexError> for BeaconError {
    fn from(err: hex::FromHexError) -> Self {
        BeaconError::InvalidPeerId(err.to_string())
    }
}
