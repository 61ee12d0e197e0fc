//! Transport Abstraction for Beacon
//!
//! A [`Transport`] is an unbound listener factory plus a dialer. Beacon runs
//! at most two of them side by side: a stream transport (TCP) and a
//! datagram-based reliable transport (QUIC).

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Which transport carried a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Stream-oriented transport
    Tcp,
    /// Datagram-based reliable transport
    Quic,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Quic => f.write_str("quic"),
        }
    }
}

/// A bidirectional byte stream
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased socket
pub type BoxedSocket = Box<dyn Socket>;

/// A socket accepted by a listener, with its remote endpoint
pub type Accepted = (BoxedSocket, SocketAddr);

/// Unbound listener factory and dialer for one transport kind
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Bind a listener to `addr`. Port 0 picks an ephemeral port.
    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Listener>>;

    /// Open an outbound connection
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedSocket>;
}

/// A bound listener
#[async_trait]
pub trait Listener: Send + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Wait for the next inbound socket. `Ok(None)` means the listener is closed.
    async fn accept(&mut self) -> io::Result<Option<Accepted>>;

    /// Release the listener and its port
    async fn close(self: Box<Self>) -> io::Result<()>;
}

/// TCP transport backed by tokio
#[derive(Debug, Default, Clone)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr).await?;
        debug!("TCP listener bound to {}", listener.local_addr()?);
        Ok(Box::new(TcpServer { listener }))
    }

    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedSocket> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

struct TcpServer {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpServer {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    async fn accept(&mut self) -> io::Result<Option<Accepted>> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Some((Box::new(stream), addr)))
    }

    async fn close(self: Box<Self>) -> io::Result<()> {
        // Dropping the tokio listener closes the socket
        drop(self.listener);
        Ok(())
    }
}
