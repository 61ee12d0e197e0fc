//! QUIC Transport for Beacon
//!
//! The datagram-based reliable transport. Each logical connection is the
//! first bidirectional stream of a QUIC connection. Peers are authenticated
//! by the identity handshake, so certificates are self-signed and not
//! verified by the dialer.

use async_trait::async_trait;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig, Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use super::transport::{Accepted, BoxedSocket, Listener, Transport, TransportKind};
use crate::error::{BeaconError, Result};
use crate::protocol::HANDSHAKE_TIMEOUT;

/// Name carried in the self-signed certificate and used as SNI
const SERVER_NAME: &str = "beacon";

/// Keep-alive interval, well under quinn's default idle timeout
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Inbound connections allowed to finish their QUIC handshake at once
pub const MAX_PENDING_INBOUND: usize = 64;

/// QUIC transport backed by quinn
pub struct QuicTransport {
    server_config: ServerConfig,
    client_config: ClientConfig,
    /// Endpoint of the bound listener, reused for outbound dials
    bound: Arc<Mutex<Option<Endpoint>>>,
    inbound_limit: usize,
}

impl QuicTransport {
    /// Create a transport with a fresh self-signed certificate
    pub fn new() -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
            .map_err(|e| BeaconError::TransportSetup(e.to_string()))?;
        let cert = certified.cert.der().clone();
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

        let mut transport = TransportConfig::default();
        transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
        let transport = Arc::new(transport);

        let mut server_config = ServerConfig::with_single_cert(vec![cert], key.into())
            .map_err(|e| BeaconError::TransportSetup(e.to_string()))?;
        server_config.transport_config(Arc::clone(&transport));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let crypto = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| BeaconError::TransportSetup(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth();
        let crypto = QuicClientConfig::try_from(crypto)
            .map_err(|e| BeaconError::TransportSetup(e.to_string()))?;

        let mut client_config = ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(transport);

        Ok(Self {
            server_config,
            client_config,
            bound: Arc::new(Mutex::new(None)),
            inbound_limit: MAX_PENDING_INBOUND,
        })
    }

    /// Cap inbound connections still establishing; extra ones are refused
    pub fn with_inbound_limit(mut self, limit: usize) -> Self {
        self.inbound_limit = limit.max(1);
        self
    }

    fn bound_endpoint(&self) -> Option<Endpoint> {
        lock(&self.bound).clone()
    }

    fn client_endpoint(&self, remote: SocketAddr) -> io::Result<Endpoint> {
        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = Endpoint::client(local)?;
        endpoint.set_default_client_config(self.client_config.clone());
        Ok(endpoint)
    }
}

impl std::fmt::Debug for QuicTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicTransport")
            .field("bound", &self.bound_endpoint().and_then(|e| e.local_addr().ok()))
            .finish()
    }
}

fn lock(slot: &Mutex<Option<Endpoint>>) -> MutexGuard<'_, Option<Endpoint>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for QuicTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }

    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Listener>> {
        let mut endpoint = Endpoint::server(self.server_config.clone(), addr)?;
        endpoint.set_default_client_config(self.client_config.clone());
        debug!("QUIC endpoint bound to {}", endpoint.local_addr()?);

        *lock(&self.bound) = Some(endpoint.clone());

        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Ok(Box::new(QuicListener {
            endpoint,
            bound: Arc::clone(&self.bound),
            establishing: Arc::new(Semaphore::new(self.inbound_limit)),
            ready_tx,
            ready_rx,
        }))
    }

    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedSocket> {
        let endpoint = match self.bound_endpoint() {
            Some(endpoint) => endpoint,
            None => self.client_endpoint(addr)?,
        };

        let connection = endpoint
            .connect(addr, SERVER_NAME)
            .map_err(io::Error::other)?
            .await
            .map_err(io::Error::other)?;
        let (send, recv) = connection.open_bi().await.map_err(io::Error::other)?;

        Ok(Box::new(QuicStream {
            _connection: connection,
            _endpoint: endpoint,
            send,
            recv,
        }))
    }
}

struct QuicListener {
    endpoint: Endpoint,
    bound: Arc<Mutex<Option<Endpoint>>>,
    establishing: Arc<Semaphore>,
    ready_tx: mpsc::UnboundedSender<io::Result<Accepted>>,
    ready_rx: mpsc::UnboundedReceiver<io::Result<Accepted>>,
}

#[async_trait]
impl Listener for QuicListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    async fn accept(&mut self) -> io::Result<Option<Accepted>> {
        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        return Ok(None);
                    };
                    let Ok(permit) = Arc::clone(&self.establishing).try_acquire_owned() else {
                        debug!("Refusing QUIC connection from {}: too many establishing", incoming.remote_address());
                        incoming.refuse();
                        continue;
                    };
                    // Finish the QUIC handshake off the accept path so a slow
                    // peer cannot stall other inbound connections
                    let ready_tx = self.ready_tx.clone();
                    let endpoint = self.endpoint.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, establish(incoming, endpoint))
                            .await
                            .unwrap_or_else(|_| {
                                Err(io::Error::new(io::ErrorKind::TimedOut, "no stream opened in time"))
                            });
                        let _ = ready_tx.send(result);
                    });
                }
                Some(result) = self.ready_rx.recv() => match result {
                    Ok(accepted) => return Ok(Some(accepted)),
                    Err(e) => debug!("Dropped inbound QUIC connection: {}", e),
                },
            }
        }
    }

    async fn close(self: Box<Self>) -> io::Result<()> {
        {
            let mut bound = lock(&self.bound);
            if bound.as_ref().is_some_and(|e| e.local_addr().ok() == self.endpoint.local_addr().ok()) {
                *bound = None;
            }
        }

        self.endpoint.close(0u32.into(), b"closing");
        self.endpoint.wait_idle().await;
        Ok(())
    }
}

async fn establish(incoming: quinn::Incoming, endpoint: Endpoint) -> io::Result<Accepted> {
    let connection = incoming.await.map_err(io::Error::other)?;
    let addr = connection.remote_address();
    let (send, recv) = connection.accept_bi().await.map_err(io::Error::other)?;

    Ok((
        Box::new(QuicStream {
            _connection: connection,
            _endpoint: endpoint,
            send,
            recv,
        }),
        addr,
    ))
}

/// One bidirectional QUIC stream, keeping its connection and endpoint alive
struct QuicStream {
    _connection: quinn::Connection,
    _endpoint: Endpoint,
    send: SendStream,
    recv: RecvStream,
}

impl AsyncRead for QuicStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.get_mut().recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
    }
}

/// Certificate verifier that accepts any server certificate but still checks
/// handshake signatures against it
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
