//! Shared test doubles
//!
//! An in-memory network whose transports hand out `tokio::io::duplex`
//! sockets, plus helpers for waiting on manager events.

#![allow(dead_code)]

use async_trait::async_trait;
use bc_core::network::{Accepted, BoxedSocket, Listener, Transport};
use bc_core::{Beacon, BeaconConfig, BeaconEvent, EventReceiver, Options, TransportKind};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// First port handed out for ephemeral binds
pub const FIRST_PORT: u16 = 40000;

const DUPLEX_CAPACITY: usize = 64 * 1024;

type Inbox = mpsc::UnboundedSender<Accepted>;

struct NetState {
    next_port: u16,
    listeners: HashMap<(TransportKind, u16), Inbox>,
}

/// A network of in-memory listeners, one port space per transport kind
#[derive(Clone)]
pub struct MemoryNet {
    state: Arc<Mutex<NetState>>,
}

impl MemoryNet {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState {
                next_port: FIRST_PORT,
                listeners: HashMap::new(),
            })),
        }
    }

    pub fn transport(&self, kind: TransportKind) -> MemoryTransport {
        MemoryTransport {
            net: self.clone(),
            kind,
            reject: Arc::new(Mutex::new(Rejections::default())),
        }
    }

    /// Whether a listener of `kind` currently holds `port`
    pub fn is_bound(&self, kind: TransportKind, port: u16) -> bool {
        self.state.lock().unwrap().listeners.contains_key(&(kind, port))
    }

    fn allocate(&self) -> u16 {
        let mut state = self.state.lock().unwrap();
        let port = state.next_port;
        state.next_port += 1;
        port
    }
}

#[derive(Default)]
struct Rejections {
    ports: HashSet<u16>,
    all: bool,
    binds: u32,
}

/// Transport over a [`MemoryNet`]
#[derive(Clone)]
pub struct MemoryTransport {
    net: MemoryNet,
    kind: TransportKind,
    reject: Arc<Mutex<Rejections>>,
}

impl MemoryTransport {
    /// Refuse binds to `port` as if it were taken by someone else
    pub fn reject_port(self, port: u16) -> Self {
        self.reject.lock().unwrap().ports.insert(port);
        self
    }

    /// Refuse every bind
    pub fn reject_all(self) -> Self {
        self.reject.lock().unwrap().all = true;
        self
    }

    /// Bind attempts seen so far
    pub fn binds(&self) -> u32 {
        self.reject.lock().unwrap().binds
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Listener>> {
        let port = if addr.port() == 0 {
            self.net.allocate()
        } else {
            addr.port()
        };

        {
            let mut reject = self.reject.lock().unwrap();
            reject.binds += 1;
            if reject.all || reject.ports.contains(&port) {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"));
            }
        }

        let mut state = self.net.state.lock().unwrap();
        if state.listeners.contains_key(&(self.kind, port)) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.insert((self.kind, port), tx);

        Ok(Box::new(MemoryListener {
            net: self.net.clone(),
            kind: self.kind,
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            rx,
        }))
    }

    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedSocket> {
        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, self.net.allocate()));
        let inbox = self
            .net
            .state
            .lock()
            .unwrap()
            .listeners
            .get(&(self.kind, addr.port()))
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "nobody listening"))?;

        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        inbox
            .send((Box::new(server), local))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;
        Ok(Box::new(client))
    }
}

struct MemoryListener {
    net: MemoryNet,
    kind: TransportKind,
    addr: SocketAddr,
    rx: mpsc::UnboundedReceiver<Accepted>,
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    async fn accept(&mut self) -> io::Result<Option<Accepted>> {
        Ok(self.rx.recv().await)
    }

    async fn close(self: Box<Self>) -> io::Result<()> {
        self.net
            .state
            .lock()
            .unwrap()
            .listeners
            .remove(&(self.kind, self.addr.port()));
        Ok(())
    }
}

/// Configuration bound to localhost
pub fn local_config() -> BeaconConfig {
    BeaconConfig::new().with_host(Ipv4Addr::LOCALHOST.into())
}

/// Options for a manager running both transports over `net`
pub fn memory_options(net: &MemoryNet) -> Options {
    Options::new(local_config())
        .with_stream_transport(net.transport(TransportKind::Tcp))
        .with_datagram_transport(net.transport(TransportKind::Quic))
}

/// Options for a manager running only the stream transport over `net`
pub fn stream_only_options(net: &MemoryNet) -> Options {
    Options::new(local_config().with_quic(false))
        .with_stream_transport(net.transport(TransportKind::Tcp))
}

pub fn spawn(options: Options) -> (Beacon, EventReceiver) {
    Beacon::new(options).expect("Should create beacon")
}

/// Next event, failing the test after a few seconds
pub async fn next_event(events: &mut EventReceiver) -> BeaconEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Should receive an event in time")
        .expect("Event stream should be open")
}

/// Skip events until a connection arrives
pub async fn next_connection(
    events: &mut EventReceiver,
) -> (bc_core::Connection, bc_core::ConnectionInfo) {
    loop {
        match next_event(events).await {
            BeaconEvent::Connection(connection, info) => return (connection, info),
            BeaconEvent::Close => panic!("closed while waiting for a connection"),
            _ => {}
        }
    }
}

/// Skip events until the close event arrives
pub async fn wait_closed(events: &mut EventReceiver) {
    loop {
        if let BeaconEvent::Close = next_event(events).await {
            return;
        }
    }
}

/// Poll `check` until it holds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Install a test subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
