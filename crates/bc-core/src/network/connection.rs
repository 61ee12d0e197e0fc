//! Connection handles handed to the application
//!
//! A [`Connection`] exists only once its handshake completed. It reports its
//! close to the manager exactly once: on [`Connection::destroy`], on drop, on
//! a transport error or end of stream, or when the manager cancels it during
//! shutdown. Cancellation releases the socket even if the application never
//! polls the handle again. Dropping a connection also stops any pump feeding
//! it.

use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use super::identity::PeerId;
use super::registry::ConnectionId;
use super::transport::{BoxedSocket, TransportKind};

/// Channel on which connections report their close to the manager
pub(crate) type CloseTx = mpsc::UnboundedSender<ConnectionId>;

/// Describes a connection to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Transport that carried the connection
    pub kind: TransportKind,
    /// True if we dialed the peer
    pub initiator: bool,
    /// Remote identity, set once the handshake completes
    pub id: Option<PeerId>,
    /// Peer host
    pub host: IpAddr,
    /// Peer port
    pub port: u16,
    /// Discovery channel the peer was found on (outbound only)
    pub channel: Option<Bytes>,
}

struct Slot {
    io: Option<BoxedSocket>,
    close_tx: Option<CloseTx>,
}

/// Socket shared between the handle and its cancellation watcher
struct Shared {
    id: ConnectionId,
    slot: Mutex<Slot>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the socket and notify the manager, once
    fn release(&self, reason: &str) {
        let (io, close_tx) = {
            let mut slot = self.lock();
            (slot.io.take(), slot.close_tx.take())
        };
        if io.is_some() {
            debug!("Connection {} released: {}", self.id, reason);
        }
        drop(io);
        if let Some(close_tx) = close_tx {
            let _ = close_tx.send(self.id);
        }
    }
}

/// An established, handshaked connection
pub struct Connection {
    info: ConnectionInfo,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl Connection {
    /// Must be called from within a tokio runtime
    pub(crate) fn new(
        id: ConnectionId,
        info: ConnectionInfo,
        io: BoxedSocket,
        cancel: CancellationToken,
        close_tx: CloseTx,
    ) -> Self {
        let shared = Arc::new(Shared {
            id,
            slot: Mutex::new(Slot {
                io: Some(io),
                close_tx: Some(close_tx),
            }),
        });

        let watcher = Arc::clone(&shared);
        let token = cancel.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            watcher.release("cancelled");
        });

        let cancelled = Box::pin(cancel.clone().cancelled_owned());
        Self {
            info,
            shared,
            cancel,
            cancelled,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Identity the peer presented in the handshake
    pub fn remote_id(&self) -> Option<&PeerId> {
        self.info.id.as_ref()
    }

    pub fn kind(&self) -> TransportKind {
        self.info.kind
    }

    pub fn is_initiator(&self) -> bool {
        self.info.initiator
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().io.is_none()
    }

    /// Close the underlying socket immediately
    pub fn destroy(&mut self) {
        self.cancel.cancel();
        self.shared.release("destroyed");
    }

    /// Drive the socket, releasing it on cancellation or transport error
    fn poll_io<T>(
        &mut self,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut BoxedSocket>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        // Registers the waker so pending I/O wakes up on cancellation
        if !self.cancel.is_cancelled() {
            let _ = self.cancelled.as_mut().poll(cx);
        }
        if self.cancel.is_cancelled() {
            self.shared.release("cancelled");
            return Poll::Ready(Err(aborted()));
        }

        let poll = {
            let mut slot = self.shared.lock();
            match slot.io.as_mut() {
                Some(io) => op(Pin::new(io), cx),
                None => return Poll::Ready(Err(aborted())),
            }
        };
        if let Poll::Ready(Err(e)) = &poll {
            debug!("Connection {} transport error: {}", self.shared.id, e);
            self.shared.release("transport error");
        }
        poll
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection destroyed")
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.shared.release("dropped");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("info", &self.info)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let wants = buf.remaining() > 0;
        let poll = this.poll_io(cx, |io, cx| io.poll_read(cx, buf));
        if let Poll::Ready(Ok(())) = poll {
            if wants && buf.filled().len() == before {
                this.shared.release("end of stream");
            }
        }
        poll
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().poll_io(cx, |io, cx| io.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_io(cx, |io, cx| io.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_io(cx, |io, cx| io.poll_shutdown(cx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Registry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            kind: TransportKind::Tcp,
            initiator: true,
            id: Some(PeerId::random()),
            host: "127.0.0.1".parse().unwrap(),
            port: 4000,
            channel: None,
        }
    }

    fn make(cancel: CancellationToken) -> (Connection, tokio::io::DuplexStream, mpsc::UnboundedReceiver<ConnectionId>) {
        let mut registry = Registry::new();
        let id = registry.open();
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let (local, remote) = tokio::io::duplex(64);
        (Connection::new(id, info(), Box::new(local), cancel, close_tx), remote, close_rx)
    }

    #[tokio::test]
    async fn test_passes_bytes_through() {
        let (mut conn, mut remote, _rx) = make(CancellationToken::new());
        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_drop_reports_close_once() {
        let (mut conn, _remote, mut rx) = make(CancellationToken::new());
        let id = conn.id();
        conn.destroy();
        drop(conn);

        assert_eq!(rx.recv().await, Some(id));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_wakes_pending_read() {
        let cancel = CancellationToken::new();
        let (mut conn, _remote, mut rx) = make(cancel.clone());
        let id = conn.id();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            let result = conn.read(&mut buf).await;
            (result, conn.is_destroyed())
        });
        tokio::task::yield_now().await;
        cancel.cancel();

        let (result, destroyed) = reader.await.unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
        assert!(destroyed);
        assert_eq!(rx.recv().await, Some(id));
    }

    #[tokio::test]
    async fn test_end_of_stream_releases() {
        let (mut conn, remote, mut rx) = make(CancellationToken::new());
        let id = conn.id();
        drop(remote);

        let mut buf = [0u8; 4];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert!(conn.is_destroyed());
        assert_eq!(rx.recv().await, Some(id));
    }

    #[tokio::test]
    async fn test_cancel_releases_idle_handle() {
        let cancel = CancellationToken::new();
        let (conn, mut remote, mut rx) = make(cancel.clone());
        let id = conn.id();

        cancel.cancel();
        assert_eq!(rx.recv().await, Some(id));
        assert!(conn.is_destroyed());

        // The peer sees the socket go away without the handle being polled
        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
        drop(conn);
        assert!(rx.try_recv().is_err());
    }
}
