//! Stream multiplexing collaborators
//!
//! Instead of the built-in identity handshake, a caller may wrap every raw
//! socket in its own protocol stream. The wrapped protocol decides when the
//! handshake is done and which identity the peer has.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::io;
use tracing::debug;

use super::connection::ConnectionInfo;
use super::identity::PeerId;
use super::transport::BoxedSocket;

/// Output of a [`StreamFactory`]
pub struct WrappedStream {
    /// Stream handed to the application once the handshake resolves
    pub stream: BoxedSocket,
    /// Protocol side wired to the raw socket
    pub wire: BoxedSocket,
    /// Resolves when the wrapped protocol finished its own handshake
    pub handshake: BoxFuture<'static, io::Result<Option<PeerId>>>,
}

/// Builds the protocol stream for a new connection
pub trait StreamFactory: Send + Sync + 'static {
    fn create(&self, info: &ConnectionInfo) -> WrappedStream;
}

impl<F> StreamFactory for F
where
    F: Fn(&ConnectionInfo) -> WrappedStream + Send + Sync + 'static,
{
    fn create(&self, info: &ConnectionInfo) -> WrappedStream {
        self(info)
    }
}

/// Connects a raw socket to the wire side of a wrapped stream
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Runs until either side closes
    async fn wire(&self, raw: BoxedSocket, wrapped: BoxedSocket) -> io::Result<()>;
}

/// Default connector: copies bytes in both directions
#[derive(Debug, Default, Clone, Copy)]
pub struct Pump;

#[async_trait]
impl Connector for Pump {
    async fn wire(&self, mut raw: BoxedSocket, mut wrapped: BoxedSocket) -> io::Result<()> {
        let (up, down) = tokio::io::copy_bidirectional(&mut raw, &mut wrapped).await?;
        debug!("Pump finished: {} bytes in, {} bytes out", up, down);
        Ok(())
    }
}
