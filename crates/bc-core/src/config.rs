//! Configuration management for Beacon
//!
//! [`BeaconConfig`] is the serialisable part (TOML on disk). [`Options`]
//! adds the runtime collaborators a [`crate::Beacon`] is built from.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::brand;
use crate::error::Result;
use crate::network::{
    Connector, DiscoveryFactory, PeerId, PeerIdentity, StreamFactory, Transport,
};

/// Settings for one discovery backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Use this backend at all
    pub enabled: bool,
    /// Bootstrap servers, `host:port`
    pub servers: Vec<String>,
}

impl BackendConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            servers: Vec::new(),
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.servers.push(server.into());
        self
    }
}

/// Main configuration for Beacon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Interface both listeners bind to
    pub host: IpAddr,

    /// Port used by `listen` when none is given (0 = ephemeral)
    pub listen_port: u16,

    /// Enable the stream transport
    pub tcp: bool,

    /// Enable the datagram-based reliable transport
    pub quic: bool,

    /// Where the local identity is persisted. Unset means a fresh identity per run.
    pub identity_path: Option<PathBuf>,

    /// Fixed local identity as hex, takes precedence over `identity_path`
    pub id: Option<String>,

    /// DNS discovery backend
    pub dns: BackendConfig,

    /// DHT discovery backend
    pub dht: BackendConfig,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 0,
            tcp: true,
            quic: cfg!(feature = "quic"),
            identity_path: None,
            id: None,
            dns: BackendConfig::enabled(),
            dht: BackendConfig::enabled(),
        }
    }
}

impl BeaconConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Loads the configuration at `path`, or the defaults if the file does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Saves configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Returns the default configuration directory
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(brand::CONFIG_DIR_NAME)
    }

    /// Returns the default configuration file path
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default identity file path
    pub fn default_identity_path() -> PathBuf {
        Self::default_config_dir().join("identity.key")
    }

    /// The local identity this configuration describes
    pub fn resolve_identity(&self) -> Result<PeerId> {
        if let Some(id) = &self.id {
            return id.parse();
        }
        match &self.identity_path {
            Some(path) => Ok(PeerIdentity::load_or_generate(path)?.peer_id().clone()),
            None => Ok(PeerId::random()),
        }
    }

    /// Builder pattern: set bind host
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Builder pattern: set listen port
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Builder pattern: enable/disable the stream transport
    pub fn with_tcp(mut self, enable: bool) -> Self {
        self.tcp = enable;
        self
    }

    /// Builder pattern: enable/disable the datagram transport
    pub fn with_quic(mut self, enable: bool) -> Self {
        self.quic = enable;
        self
    }

    /// Builder pattern: persist the identity at `path`
    pub fn with_identity_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_path = Some(path.into());
        self
    }

    /// Builder pattern: pin the identity
    pub fn with_id(mut self, id: &PeerId) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Builder pattern: DNS backend settings
    pub fn with_dns(mut self, dns: BackendConfig) -> Self {
        self.dns = dns;
        self
    }

    /// Builder pattern: DHT backend settings
    pub fn with_dht(mut self, dht: BackendConfig) -> Self {
        self.dht = dht;
        self
    }
}

/// Everything a [`crate::Beacon`] is built from
#[derive(Clone, Default)]
pub struct Options {
    pub config: BeaconConfig,
    /// Local identity, overrides the configured one
    pub id: Option<PeerId>,
    /// Wraps every raw socket in a protocol stream instead of the identity handshake
    pub stream: Option<Arc<dyn StreamFactory>>,
    /// Pumps raw sockets into wrapped streams. Defaults to [`crate::network::Pump`].
    pub connect: Option<Arc<dyn Connector>>,
    /// Creates the discovery backend on the first `listen`
    pub discovery: Option<Arc<dyn DiscoveryFactory>>,
    /// Replaces the TCP transport
    pub stream_transport: Option<Arc<dyn Transport>>,
    /// Replaces the QUIC transport
    pub datagram_transport: Option<Arc<dyn Transport>>,
}

impl Options {
    pub fn new(config: BeaconConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: PeerId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_stream(mut self, factory: impl StreamFactory) -> Self {
        self.stream = Some(Arc::new(factory));
        self
    }

    pub fn with_connector(mut self, connector: impl Connector) -> Self {
        self.connect = Some(Arc::new(connector));
        self
    }

    pub fn with_discovery(mut self, factory: impl DiscoveryFactory) -> Self {
        self.discovery = Some(Arc::new(factory));
        self
    }

    pub fn with_stream_transport(mut self, transport: impl Transport) -> Self {
        self.stream_transport = Some(Arc::new(transport));
        self
    }

    pub fn with_datagram_transport(mut self, transport: impl Transport) -> Self {
        self.datagram_transport = Some(Arc::new(transport));
        self
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("config", &self.config)
            .field("id", &self.id)
            .field("stream", &self.stream.is_some())
            .field("connect", &self.connect.is_some())
            .field("discovery", &self.discovery.is_some())
            .field("stream_transport", &self.stream_transport.is_some())
            .field("datagram_transport", &self.datagram_transport.is_some())
            .finish()
    }
}
