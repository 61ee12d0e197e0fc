//! Network Module for Beacon
//!
//! Transports, the dual-bind coordinator, connection accounting and the
//! manager task that ties them together.

pub mod bind;
pub mod connection;
pub mod discovery;
pub mod identity;
#[cfg(feature = "quic")]
pub mod quic;
pub mod registry;
pub mod stream;
pub mod swarm;
pub mod transport;

pub use bind::{BindCoordinator, BindStep, BoundListeners, MAX_BIND_ATTEMPTS};
pub use connection::{Connection, ConnectionInfo};
pub use discovery::{
    AnnounceOptions, DiscoveredPeer, Discovery, DiscoveryConfig, DiscoveryFactory,
    DiscoverySink, JoinOptions, MemoryDiscovery, Topic,
};
pub use identity::{PeerId, PeerIdentity, ID_LEN};
#[cfg(feature = "quic")]
pub use quic::QuicTransport;
pub use registry::{ConnectionId, Counts, Registry};
pub use stream::{Connector, Pump, StreamFactory, WrappedStream};
pub use swarm::{Beacon, BeaconEvent, EventReceiver};
pub use transport::{Accepted, BoxedSocket, Listener, Socket, TcpTransport, Transport, TransportKind};
