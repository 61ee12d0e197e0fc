//! Swarm Management for Beacon
//!
//! [`Beacon`] is a cloneable handle to a single manager task. The task owns
//! the listeners, the connection registry and the discovery backend; every
//! I/O step runs in a spawned task that reports back with exactly one
//! message, so the manager state is only ever touched from one place.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bind::{BindCoordinator, BindStep, BoundListeners};
use super::connection::{CloseTx, Connection, ConnectionInfo};
use super::discovery::{
    AnnounceOptions, DiscoveredPeer, Discovery, DiscoveryConfig, DiscoveryEvent,
    DiscoveryFactory, DiscoverySink, JoinOptions, Topic,
};
use super::identity::PeerId;
use super::registry::{ConnectionId, Counts, Registry};
use super::stream::{Connector, Pump, StreamFactory, WrappedStream};
use super::transport::{BoxedSocket, Listener, TcpTransport, Transport, TransportKind};
use crate::config::{BackendConfig, BeaconConfig, Options};
use crate::error::{BeaconError, HandshakeError, Result};
use crate::protocol::{self, HANDSHAKE_TIMEOUT};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Events emitted by a [`Beacon`]
#[derive(Debug)]
pub enum BeaconEvent {
    /// Every enabled listener is bound to the given address
    Listening(SocketAddr),
    /// A connection completed its handshake
    Connection(Connection, ConnectionInfo),
    /// A listener or discovery error. Never fatal.
    Error(BeaconError),
    /// Shutdown finished. Emitted exactly once, always last.
    Close,
}

/// Receiving side of the event stream
pub type EventReceiver = mpsc::UnboundedReceiver<BeaconEvent>;

/// State readable without a round trip to the manager task
#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    counts: Counts,
    address: Option<SocketAddr>,
    listening: bool,
    destroyed: bool,
}

enum Command {
    Listen {
        port: u16,
        reply: oneshot::Sender<Result<SocketAddr>>,
    },
    Connect {
        addr: SocketAddr,
        kind: TransportKind,
        reply: oneshot::Sender<Result<()>>,
    },
    Join {
        topic: Topic,
        options: JoinOptions,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        topic: Topic,
        reply: oneshot::Sender<()>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}

type Handshaked = std::result::Result<(BoxedSocket, Option<PeerId>), HandshakeError>;

/// Reports from spawned I/O tasks
enum Internal {
    Bound {
        kind: TransportKind,
        result: io::Result<Box<dyn Listener>>,
    },
    ListenerClosed {
        retry: bool,
    },
    Accepted {
        kind: TransportKind,
        socket: BoxedSocket,
        remote: SocketAddr,
    },
    AcceptFailed {
        kind: TransportKind,
        error: io::Error,
    },
    Dialed {
        info: ConnectionInfo,
        result: io::Result<BoxedSocket>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Handshaked {
        id: ConnectionId,
        info: ConnectionInfo,
        cancel: CancellationToken,
        outcome: Handshaked,
    },
}

struct PendingJoin {
    topic: Topic,
    options: JoinOptions,
    reply: oneshot::Sender<Result<()>>,
}

/// Handle to a running connection manager
#[derive(Clone)]
pub struct Beacon {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<Snapshot>,
    local_id: PeerId,
}

impl Beacon {
    /// Create a manager and start its task on the current tokio runtime.
    ///
    /// Transports are created here but bound only by [`Beacon::listen`]. The
    /// manager destroys itself once every handle is dropped.
    pub fn new(options: Options) -> Result<(Self, EventReceiver)> {
        let Options {
            config,
            id,
            stream,
            connect,
            discovery,
            stream_transport,
            datagram_transport,
        } = options;

        let local_id = match id {
            Some(id) => id,
            None => config.resolve_identity()?,
        };

        let stream_transport = stream_transport.or_else(|| {
            config
                .tcp
                .then(|| Arc::new(TcpTransport::new()) as Arc<dyn Transport>)
        });
        let datagram_transport = match datagram_transport {
            Some(transport) => Some(transport),
            None => default_datagram_transport(&config)?,
        };

        info!("Local peer ID: {}", local_id);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(Snapshot::default());

        let swarm = Swarm {
            local_id: local_id.clone(),
            host: config.host,
            default_port: config.listen_port,
            dns: config.dns,
            dht: config.dht,
            coordinator: BindCoordinator::new(
                stream_transport.is_some(),
                datagram_transport.is_some(),
            ),
            stream_transport,
            datagram_transport,
            stream_factory: stream,
            connector: connect.unwrap_or_else(|| Arc::new(Pump)),
            discovery_factory: discovery,
            discovery: None,
            discovery_rx: None,
            registry: Registry::new(),
            address: None,
            datagram_bound: false,
            topics: HashMap::new(),
            listen_waiters: Vec::new(),
            join_waiters: Vec::new(),
            destroy_waiters: Vec::new(),
            pending: 0,
            destroyed: false,
            closed: false,
            handles_gone: false,
            cancel: CancellationToken::new(),
            commands: command_rx,
            internal_tx,
            internal_rx,
            close_tx,
            close_rx,
            events: event_tx,
            state: state_tx,
        };
        tokio::spawn(swarm.run());

        Ok((
            Self {
                commands: command_tx,
                state: state_rx,
                local_id,
            },
            event_rx,
        ))
    }

    /// Bind the enabled listeners to `port` (0 = ephemeral).
    ///
    /// Resolves once every listener is bound. While already bound this returns
    /// the bound address; while binding it waits for the same outcome.
    ///
    /// After [`Beacon::destroy`] nothing is bound and this resolves to
    /// [`BeaconError::Destroyed`], since there is no address to report.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Listen { port, reply }).is_err() {
            return Err(BeaconError::Destroyed);
        }
        rx.await.unwrap_or(Err(BeaconError::Destroyed))
    }

    /// Dial `addr` directly over the given transport.
    ///
    /// Resolves when the socket is open. The handshaked connection arrives as
    /// a [`BeaconEvent::Connection`].
    pub async fn connect(&self, addr: SocketAddr, kind: TransportKind) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Connect { addr, kind, reply }).is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Announce and look up `topic`, listening first if needed
    pub async fn join(&self, topic: impl Into<Topic>, options: JoinOptions) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Join {
            topic: topic.into(),
            options,
            reply,
        };
        if self.commands.send(command).is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Stop announcing and looking up `topic`
    pub async fn leave(&self, topic: impl Into<Topic>) {
        let (reply, rx) = oneshot::channel();
        let command = Command::Leave {
            topic: topic.into(),
            reply,
        };
        if self.commands.send(command).is_ok() {
            let _ = rx.await;
        }
    }

    /// Shut down and wait for [`BeaconEvent::Close`].
    ///
    /// Later calls resolve immediately.
    pub async fn destroy(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Destroy { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Alias for [`Beacon::destroy`]
    pub async fn close(&self) {
        self.destroy().await
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Address of the stream listener, else of the datagram listener
    pub fn address(&self) -> Option<SocketAddr> {
        self.state.borrow().address
    }

    /// Connection counters, consistent with each other
    pub fn counts(&self) -> Counts {
        self.state.borrow().counts
    }

    /// Connections still handshaking
    pub fn connecting(&self) -> usize {
        self.counts().connecting()
    }

    /// Handshaked connections
    pub fn connected(&self) -> usize {
        self.counts().connected
    }

    /// All admitted connections
    pub fn total_connections(&self) -> usize {
        self.counts().total
    }

    pub fn is_listening(&self) -> bool {
        self.state.borrow().listening
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }
}

impl std::fmt::Debug for Beacon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = *self.state.borrow();
        f.debug_struct("Beacon")
            .field("local_id", &self.local_id)
            .field("address", &snapshot.address)
            .field("counts", &snapshot.counts)
            .field("destroyed", &snapshot.destroyed)
            .finish()
    }
}

#[cfg(feature = "quic")]
fn default_datagram_transport(config: &BeaconConfig) -> Result<Option<Arc<dyn Transport>>> {
    if !config.quic {
        return Ok(None);
    }
    Ok(Some(Arc::new(super::quic::QuicTransport::new()?)))
}

#[cfg(not(feature = "quic"))]
fn default_datagram_transport(config: &BeaconConfig) -> Result<Option<Arc<dyn Transport>>> {
    if config.quic {
        warn!("Built without QUIC support, datagram transport disabled");
    }
    Ok(None)
}

/// The manager task
struct Swarm {
    local_id: PeerId,
    host: IpAddr,
    default_port: u16,
    dns: BackendConfig,
    dht: BackendConfig,

    stream_transport: Option<Arc<dyn Transport>>,
    datagram_transport: Option<Arc<dyn Transport>>,
    stream_factory: Option<Arc<dyn StreamFactory>>,
    connector: Arc<dyn Connector>,
    discovery_factory: Option<Arc<dyn DiscoveryFactory>>,
    discovery: Option<Box<dyn Discovery>>,
    discovery_rx: Option<mpsc::UnboundedReceiver<DiscoveryEvent>>,

    registry: Registry,
    coordinator: BindCoordinator,
    address: Option<SocketAddr>,
    datagram_bound: bool,
    /// Joined topics and the port announced for each
    topics: HashMap<Topic, Option<u16>>,

    listen_waiters: Vec<oneshot::Sender<Result<SocketAddr>>>,
    join_waiters: Vec<PendingJoin>,
    destroy_waiters: Vec<oneshot::Sender<()>>,

    /// Listener tasks (bind, accept, close) that have yet to report back
    pending: usize,
    destroyed: bool,
    closed: bool,
    handles_gone: bool,
    cancel: CancellationToken,

    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    close_tx: CloseTx,
    close_rx: mpsc::UnboundedReceiver<ConnectionId>,
    events: mpsc::UnboundedSender<BeaconEvent>,
    state: watch::Sender<Snapshot>,
}

async fn next_discovery(
    rx: &mut Option<mpsc::UnboundedReceiver<DiscoveryEvent>>,
) -> Option<DiscoveryEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Swarm {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv(), if !self.handles_gone => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("All handles dropped, shutting down");
                        self.handles_gone = true;
                        self.begin_destroy(None);
                    }
                },
                Some(message) = self.internal_rx.recv() => self.on_internal(message),
                Some(id) = self.close_rx.recv() => self.on_closed(id),
                Some(event) = next_discovery(&mut self.discovery_rx) => self.on_discovery(event),
            }

            self.publish();
            if self.handles_gone && self.closed {
                break;
            }
        }
        debug!("Manager task stopped");
    }

    fn publish(&self) {
        self.state.send_replace(Snapshot {
            counts: self.registry.counts(),
            address: self.address,
            listening: self.coordinator.is_bound() && !self.destroyed,
            destroyed: self.destroyed,
        });
    }

    fn emit(&self, event: BeaconEvent) {
        let _ = self.events.send(event);
    }

    fn transport(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        match kind {
            TransportKind::Tcp => self.stream_transport.clone(),
            TransportKind::Quic => self.datagram_transport.clone(),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Listen { port, reply } => self.on_listen(port, reply),
            Command::Connect { addr, kind, reply } => self.on_connect(addr, kind, reply),
            Command::Join {
                topic,
                options,
                reply,
            } => self.on_join(topic, options, reply),
            Command::Leave { topic, reply } => {
                self.on_leave(&topic);
                let _ = reply.send(());
            }
            Command::Destroy { reply } => self.begin_destroy(Some(reply)),
        }
    }

    fn on_listen(&mut self, port: u16, reply: oneshot::Sender<Result<SocketAddr>>) {
        if self.destroyed {
            let _ = reply.send(Err(BeaconError::Destroyed));
            return;
        }
        if let (true, Some(addr)) = (self.coordinator.is_bound(), self.address) {
            let _ = reply.send(Ok(addr));
            return;
        }

        self.listen_waiters.push(reply);
        if self.coordinator.is_idle() {
            self.start_listen(port);
        }
    }

    fn start_listen(&mut self, port: u16) {
        if self.discovery.is_none() {
            self.create_discovery();
        }
        debug!("Binding listeners to port {}", port);
        let step = self.coordinator.start(port);
        self.execute(step);
    }

    fn create_discovery(&mut self) {
        let Some(factory) = self.discovery_factory.clone() else {
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let config = DiscoveryConfig {
            dns: self.dns.clone(),
            dht: self.dht.clone(),
            datagram: self.datagram_transport.is_some(),
        };
        match factory.create(config, DiscoverySink::new(tx)) {
            Ok(discovery) => {
                self.discovery = Some(discovery);
                self.discovery_rx = Some(rx);
            }
            Err(e) => {
                warn!("Failed to start discovery: {}", e);
                self.emit(BeaconEvent::Error(e));
            }
        }
    }

    fn on_connect(
        &mut self,
        addr: SocketAddr,
        kind: TransportKind,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if self.destroyed {
            let _ = reply.send(Ok(()));
            return;
        }
        let info = ConnectionInfo {
            kind,
            initiator: true,
            id: None,
            host: addr.ip(),
            port: addr.port(),
            channel: None,
        };
        self.dial(info, Some(reply));
    }

    fn on_join(&mut self, topic: Topic, options: JoinOptions, reply: oneshot::Sender<Result<()>>) {
        if self.destroyed {
            let _ = reply.send(Ok(()));
            return;
        }
        if self.discovery_factory.is_none() {
            let _ = reply.send(Err(BeaconError::DiscoveryUnavailable));
            return;
        }

        if self.coordinator.is_bound() {
            let _ = reply.send(self.announce(&topic, options));
            return;
        }

        self.join_waiters.push(PendingJoin {
            topic,
            options,
            reply,
        });
        if self.coordinator.is_idle() {
            self.start_listen(self.default_port);
        }
    }

    fn announce(&mut self, topic: &Topic, options: JoinOptions) -> Result<()> {
        let port = self.address.map(|addr| addr.port()).filter(|_| options.announce);
        let announce = AnnounceOptions {
            implied_port: options.announce && self.datagram_bound,
        };
        let discovery = self
            .discovery
            .as_mut()
            .ok_or(BeaconError::DiscoveryUnavailable)?;

        discovery.join(topic, port, announce)?;
        match port {
            Some(port) => info!("Joined {} announcing port {}", topic, port),
            None => info!("Joined {} (lookup only)", topic),
        }
        self.topics.insert(topic.clone(), port);
        Ok(())
    }

    fn on_leave(&mut self, topic: &Topic) {
        if self.destroyed {
            return;
        }

        let mut kept = Vec::with_capacity(self.join_waiters.len());
        for join in self.join_waiters.drain(..) {
            if &join.topic == topic {
                let _ = join.reply.send(Ok(()));
            } else {
                kept.push(join);
            }
        }
        self.join_waiters = kept;

        let port = match self.topics.remove(topic) {
            Some(port) => port,
            None => self.address.map(|addr| addr.port()),
        };
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.leave(topic, port);
            debug!("Left {}", topic);
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Listeners
    // ─────────────────────────────────────────────────────────────

    fn execute(&mut self, step: BindStep) {
        match step {
            BindStep::Bind { kind, port } => self.spawn_bind(kind, port),
            BindStep::Release(listener) => self.spawn_close(listener, true),
            BindStep::Ready(listeners) => self.on_ready(listeners),
            BindStep::Failed { error, release } => {
                if let Some(listener) = release {
                    self.spawn_close(listener, false);
                }
                self.on_bind_failed(error);
            }
            BindStep::Discard(listener) => {
                if let Some(listener) = listener {
                    self.spawn_close(listener, false);
                }
            }
        }
    }

    fn spawn_bind(&mut self, kind: TransportKind, port: u16) {
        let Some(transport) = self.transport(kind) else {
            let error = io::Error::other(format!("{} transport is not enabled", kind));
            let step = self.coordinator.on_bound(kind, Err(error));
            self.execute(step);
            return;
        };

        self.pending += 1;
        let addr = SocketAddr::new(self.host, port);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.bind(addr).await;
            let _ = tx.send(Internal::Bound { kind, result });
        });
    }

    fn spawn_close(&mut self, listener: Box<dyn Listener>, retry: bool) {
        self.pending += 1;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.close().await {
                debug!("Listener close failed: {}", e);
            }
            let _ = tx.send(Internal::ListenerClosed { retry });
        });
    }

    fn spawn_accept(&mut self, kind: TransportKind, mut listener: Box<dyn Listener>) {
        self.pending += 1;
        let tx = self.internal_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = listener.accept() => next,
                };
                match next {
                    Ok(Some((socket, remote))) => {
                        let accepted = Internal::Accepted {
                            kind,
                            socket,
                            remote,
                        };
                        if tx.send(accepted).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        if tx.send(Internal::AcceptFailed { kind, error }).is_err() {
                            break;
                        }
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }

            if let Err(e) = listener.close().await {
                debug!("{} listener close failed: {}", kind, e);
            }
            let _ = tx.send(Internal::ListenerClosed { retry: false });
        });
    }

    fn on_ready(&mut self, listeners: BoundListeners) {
        let addr = match listeners.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                let BoundListeners { stream, datagram } = listeners;
                for listener in stream.into_iter().chain(datagram) {
                    self.spawn_close(listener, false);
                }
                self.coordinator.abort();
                self.on_bind_failed(BeaconError::Io(e));
                return;
            }
        };

        self.address = Some(addr);
        self.datagram_bound = listeners.datagram.is_some();
        if let Some(listener) = listeners.stream {
            self.spawn_accept(TransportKind::Tcp, listener);
        }
        if let Some(listener) = listeners.datagram {
            self.spawn_accept(TransportKind::Quic, listener);
        }

        info!("Listening on {}", addr);
        self.publish();
        for waiter in self.listen_waiters.drain(..) {
            let _ = waiter.send(Ok(addr));
        }
        self.emit(BeaconEvent::Listening(addr));

        for join in std::mem::take(&mut self.join_waiters) {
            let result = self.announce(&join.topic, join.options);
            let _ = join.reply.send(result);
        }
    }

    fn on_bind_failed(&mut self, error: BeaconError) {
        warn!("Listen failed: {}", error);
        self.address = None;
        self.datagram_bound = false;
        self.publish();

        for waiter in self.listen_waiters.drain(..) {
            let _ = waiter.send(Err(error.replicate()));
        }
        for join in self.join_waiters.drain(..) {
            let _ = join.reply.send(Err(error.replicate()));
        }
        self.emit(BeaconEvent::Error(error));
    }

    // ─────────────────────────────────────────────────────────────
    // Connections
    // ─────────────────────────────────────────────────────────────

    fn dial(&mut self, info: ConnectionInfo, reply: Option<oneshot::Sender<Result<()>>>) {
        let Some(transport) = self.transport(info.kind) else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(BeaconError::TransportDisabled(info.kind)));
            }
            return;
        };

        let addr = SocketAddr::new(info.host, info.port);
        let tx = self.internal_tx.clone();
        let cancel = self.cancel.clone();
        debug!("Dialing {} over {}", addr, info.kind);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = transport.connect(addr) => result,
            };
            let _ = tx.send(Internal::Dialed {
                info,
                result,
                reply,
            });
        });
    }

    fn on_dialed(
        &mut self,
        info: ConnectionInfo,
        result: io::Result<BoxedSocket>,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        let addr = SocketAddr::new(info.host, info.port);
        let outcome = match result {
            Ok(socket) => {
                self.admit(socket, info);
                Ok(())
            }
            Err(e) if self.destroyed => {
                debug!("Dial to {} ended by shutdown: {}", addr, e);
                Ok(())
            }
            Err(e) => {
                debug!("Dial to {} failed: {}", addr, e);
                Err(BeaconError::DialFailed {
                    addr,
                    reason: e.to_string(),
                })
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    fn on_accepted(&mut self, kind: TransportKind, socket: BoxedSocket, remote: SocketAddr) {
        let info = ConnectionInfo {
            kind,
            initiator: false,
            id: None,
            host: remote.ip(),
            port: remote.port(),
            channel: None,
        };
        self.admit(socket, info);
    }

    /// Count the socket and start its handshake
    fn admit(&mut self, socket: BoxedSocket, info: ConnectionInfo) {
        if self.destroyed {
            debug!("Dropping {} socket from {}:{} after shutdown", info.kind, info.host, info.port);
            return;
        }

        let id = self.registry.open();
        let cancel = self.cancel.child_token();
        debug!(
            "Connection {} admitted ({} {}:{}, initiator: {})",
            id, info.kind, info.host, info.port, info.initiator
        );

        let handshake = Handshake {
            id,
            local_id: self.local_id.clone(),
            stream_factory: self.stream_factory.clone(),
            connector: Arc::clone(&self.connector),
            close_tx: self.close_tx.clone(),
            cancel: cancel.clone(),
        };
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(HandshakeError::Closed),
                result = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake.run(socket, &info)) => {
                    result.unwrap_or(Err(HandshakeError::Timeout))
                }
            };
            let _ = tx.send(Internal::Handshaked {
                id,
                info,
                cancel,
                outcome,
            });
        });
    }

    fn on_handshaked(
        &mut self,
        id: ConnectionId,
        mut info: ConnectionInfo,
        cancel: CancellationToken,
        outcome: Handshaked,
    ) {
        let (io, remote) = match outcome {
            Ok(done) => done,
            Err(e) => {
                debug!("Connection {} handshake failed: {}", id, e);
                cancel.cancel();
                self.registry.close(id);
                return;
            }
        };

        if self.destroyed || !self.registry.establish(id) {
            debug!("Connection {} closed before its handshake finished", id);
            cancel.cancel();
            self.registry.close(id);
            return;
        }

        info.id = remote;
        match &info.id {
            Some(peer) => info!("Connection {} established with {}", id, peer),
            None => info!("Connection {} established", id),
        }
        let connection = Connection::new(id, info.clone(), io, cancel, self.close_tx.clone());
        self.emit(BeaconEvent::Connection(connection, info));
    }

    fn on_closed(&mut self, id: ConnectionId) {
        if self.registry.close(id) {
            debug!("Connection {} closed", id);
        }
        self.check_closed();
    }

    // ─────────────────────────────────────────────────────────────
    // Internal reports
    // ─────────────────────────────────────────────────────────────

    fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Bound { kind, result } => {
                self.pending -= 1;
                if self.destroyed {
                    if let Ok(listener) = result {
                        self.spawn_close(listener, false);
                    }
                } else {
                    let step = self.coordinator.on_bound(kind, result);
                    self.execute(step);
                }
            }
            Internal::ListenerClosed { retry } => {
                self.pending -= 1;
                if retry && !self.destroyed {
                    let step = self.coordinator.on_released();
                    self.execute(step);
                }
            }
            Internal::Accepted {
                kind,
                socket,
                remote,
            } => self.on_accepted(kind, socket, remote),
            Internal::AcceptFailed { kind, error } => {
                if !self.destroyed {
                    warn!("Accept error on {} listener: {}", kind, error);
                    self.emit(BeaconEvent::Error(BeaconError::AcceptFailed {
                        kind,
                        reason: error.to_string(),
                    }));
                }
            }
            Internal::Dialed {
                info,
                result,
                reply,
            } => self.on_dialed(info, result, reply),
            Internal::Handshaked {
                id,
                info,
                cancel,
                outcome,
            } => self.on_handshaked(id, info, cancel, outcome),
        }
        self.check_closed();
    }

    fn on_discovery(&mut self, event: DiscoveryEvent) {
        if self.destroyed {
            return;
        }
        match event {
            DiscoveryEvent::Peer(peer) => self.on_peer(peer),
            DiscoveryEvent::Error(message) => {
                warn!("Discovery error: {}", message);
                self.emit(BeaconEvent::Error(BeaconError::Discovery(message)));
            }
        }
    }

    fn on_peer(&mut self, peer: DiscoveredPeer) {
        let kind = peer
            .kind
            .filter(|kind| self.transport(*kind).is_some())
            .or_else(|| self.stream_transport.as_ref().map(|_| TransportKind::Tcp))
            .or_else(|| self.datagram_transport.as_ref().map(|_| TransportKind::Quic));
        let Some(kind) = kind else {
            return;
        };

        let info = ConnectionInfo {
            kind,
            initiator: true,
            id: None,
            host: peer.host,
            port: peer.port,
            channel: Some(peer.channel),
        };
        self.dial(info, None);
    }

    // ─────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────

    fn begin_destroy(&mut self, reply: Option<oneshot::Sender<()>>) {
        if self.destroyed {
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
            return;
        }

        info!("Shutting down");
        self.destroyed = true;
        self.destroy_waiters.extend(reply);

        if let Some(mut discovery) = self.discovery.take() {
            discovery.destroy();
        }
        self.discovery_rx = None;
        self.topics.clear();

        // Stops accept loops, dials, handshakes and established connections
        self.cancel.cancel();
        if let Some(listener) = self.coordinator.abort() {
            self.spawn_close(listener, false);
        }
        self.address = None;

        for waiter in self.listen_waiters.drain(..) {
            let _ = waiter.send(Err(BeaconError::Destroyed));
        }
        for join in self.join_waiters.drain(..) {
            let _ = join.reply.send(Ok(()));
        }

        self.check_closed();
    }

    fn check_closed(&mut self) {
        // Every listener task reported and every connection released
        if !self.destroyed || self.closed || self.pending > 0 || self.registry.counts().total > 0 {
            return;
        }

        self.closed = true;
        info!("Closed");
        self.publish();
        self.emit(BeaconEvent::Close);
        for waiter in self.destroy_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

/// Everything a handshake task needs
struct Handshake {
    id: ConnectionId,
    local_id: PeerId,
    stream_factory: Option<Arc<dyn StreamFactory>>,
    connector: Arc<dyn Connector>,
    close_tx: CloseTx,
    cancel: CancellationToken,
}

impl Handshake {
    async fn run(self, mut socket: BoxedSocket, info: &ConnectionInfo) -> Handshaked {
        let Handshake {
            id,
            local_id,
            stream_factory,
            connector,
            close_tx,
            cancel,
        } = self;

        let Some(factory) = stream_factory else {
            let remote = protocol::handshake(&mut socket, &local_id).await?;
            return Ok((socket, Some(remote)));
        };

        let WrappedStream {
            stream,
            wire,
            handshake,
        } = factory.create(info);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = connector.wire(socket, wire) => {
                    if let Err(e) = result {
                        debug!("Connection {} pump failed: {}", id, e);
                    }
                }
            }
            // The pump ending closes the connection
            let _ = close_tx.send(id);
        });

        let remote = handshake.await?;
        Ok((stream, remote))
    }
}
