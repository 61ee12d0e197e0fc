//! Dual-Bind Coordinator
//!
//! Binds the stream listener first, then the datagram listener to the port
//! the stream listener got. When the second bind loses a race for an
//! ephemeral port, the stream listener is released and the pair is retried
//! from scratch.
//!
//! The coordinator performs no I/O itself. It consumes bind results and
//! release confirmations and tells the caller what to do next.

use std::io;
use std::net::SocketAddr;
use tracing::debug;

use super::transport::{Listener, TransportKind};
use crate::error::BeaconError;

/// Full bind attempts for an ephemeral request before giving up
pub const MAX_BIND_ATTEMPTS: u32 = 8;

/// Listeners of a completed bind
pub struct BoundListeners {
    pub stream: Option<Box<dyn Listener>>,
    pub datagram: Option<Box<dyn Listener>>,
}

impl BoundListeners {
    /// The shared address of the bound pair
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match (&self.stream, &self.datagram) {
            (Some(listener), _) | (None, Some(listener)) => listener.local_addr(),
            (None, None) => Err(io::Error::new(io::ErrorKind::NotConnected, "no listener bound")),
        }
    }
}

/// What the caller must do next
pub enum BindStep {
    /// Bind a listener of `kind` to `port`
    Bind { kind: TransportKind, port: u16 },
    /// Close this listener, then report back with [`BindCoordinator::on_released`]
    Release(Box<dyn Listener>),
    /// Both listeners are bound
    Ready(BoundListeners),
    /// The bind failed for good. `release` must be closed without reporting back.
    Failed {
        error: BeaconError,
        release: Option<Box<dyn Listener>>,
    },
    /// The result did not belong to a bind in progress. Close the listener, if any.
    Discard(Option<Box<dyn Listener>>),
}

impl std::fmt::Debug for BindStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindStep::Bind { kind, port } => write!(f, "Bind({} on {})", kind, port),
            BindStep::Release(_) => f.write_str("Release"),
            BindStep::Ready(_) => f.write_str("Ready"),
            BindStep::Failed { error, .. } => write!(f, "Failed({})", error),
            BindStep::Discard(_) => f.write_str("Discard"),
        }
    }
}

enum State {
    Idle,
    BindingStream,
    BindingDatagram { stream: Option<Box<dyn Listener>>, port: u16 },
    Releasing,
    Bound,
}

/// State machine driving the listener pair to a shared port
pub struct BindCoordinator {
    stream: bool,
    datagram: bool,
    requested: u16,
    attempts: u32,
    state: State,
}

impl BindCoordinator {
    /// `stream` / `datagram` select which listeners take part
    pub fn new(stream: bool, datagram: bool) -> Self {
        Self {
            stream,
            datagram,
            requested: 0,
            attempts: 0,
            state: State::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.state, State::Bound)
    }

    /// Whether a bind is in flight
    pub fn is_binding(&self) -> bool {
        !self.is_idle() && !self.is_bound()
    }

    /// Full attempts made by the current or last bind
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Begin binding to `port` (0 = ephemeral)
    pub fn start(&mut self, port: u16) -> BindStep {
        if !self.stream && !self.datagram {
            return BindStep::Failed {
                error: BeaconError::NoTransports,
                release: None,
            };
        }

        self.requested = port;
        self.attempts = 0;
        self.next_attempt()
    }

    fn next_attempt(&mut self) -> BindStep {
        self.attempts += 1;
        if self.stream {
            self.state = State::BindingStream;
            BindStep::Bind {
                kind: TransportKind::Tcp,
                port: self.requested,
            }
        } else {
            self.state = State::BindingDatagram {
                stream: None,
                port: self.requested,
            };
            BindStep::Bind {
                kind: TransportKind::Quic,
                port: self.requested,
            }
        }
    }

    /// Feed the outcome of a [`BindStep::Bind`]
    pub fn on_bound(
        &mut self,
        kind: TransportKind,
        result: io::Result<Box<dyn Listener>>,
    ) -> BindStep {
        match (std::mem::replace(&mut self.state, State::Idle), kind) {
            (State::BindingStream, TransportKind::Tcp) => self.stream_bound(result),
            (State::BindingDatagram { stream, port }, TransportKind::Quic) => {
                self.datagram_bound(stream, port, result)
            }
            (state, _) => {
                self.state = state;
                BindStep::Discard(result.ok())
            }
        }
    }

    fn stream_bound(&mut self, result: io::Result<Box<dyn Listener>>) -> BindStep {
        let listener = match result {
            Ok(listener) => listener,
            Err(e) => return self.retry_or_fail(TransportKind::Tcp, self.requested, e, None),
        };

        if !self.datagram {
            self.state = State::Bound;
            return BindStep::Ready(BoundListeners {
                stream: Some(listener),
                datagram: None,
            });
        }

        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                return self.retry_or_fail(TransportKind::Tcp, self.requested, e, Some(listener));
            }
        };
        self.state = State::BindingDatagram {
            stream: Some(listener),
            port,
        };
        BindStep::Bind {
            kind: TransportKind::Quic,
            port,
        }
    }

    fn datagram_bound(
        &mut self,
        stream: Option<Box<dyn Listener>>,
        port: u16,
        result: io::Result<Box<dyn Listener>>,
    ) -> BindStep {
        match result {
            Ok(listener) => {
                self.state = State::Bound;
                BindStep::Ready(BoundListeners {
                    stream,
                    datagram: Some(listener),
                })
            }
            Err(e) => self.retry_or_fail(TransportKind::Quic, port, e, stream),
        }
    }

    fn retry_or_fail(
        &mut self,
        kind: TransportKind,
        port: u16,
        error: io::Error,
        held: Option<Box<dyn Listener>>,
    ) -> BindStep {
        if self.requested != 0 {
            self.state = State::Idle;
            return BindStep::Failed {
                error: BeaconError::PortBindFailed {
                    kind,
                    port,
                    reason: error.to_string(),
                },
                release: held,
            };
        }

        if self.attempts >= MAX_BIND_ATTEMPTS {
            self.state = State::Idle;
            return BindStep::Failed {
                error: BeaconError::BindRetriesExhausted {
                    attempts: self.attempts,
                },
                release: held,
            };
        }

        debug!(
            "{} bind on port {} failed ({}), retrying (attempt {}/{})",
            kind,
            port,
            error,
            self.attempts + 1,
            MAX_BIND_ATTEMPTS
        );
        match held {
            Some(listener) => {
                self.state = State::Releasing;
                BindStep::Release(listener)
            }
            None => self.next_attempt(),
        }
    }

    /// Confirm that a [`BindStep::Release`] finished
    pub fn on_released(&mut self) -> BindStep {
        match self.state {
            State::Releasing => self.next_attempt(),
            _ => BindStep::Discard(None),
        }
    }

    /// Abandon any bind in progress, handing back a listener held mid-bind
    pub fn abort(&mut self) -> Option<Box<dyn Listener>> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::BindingDatagram { stream, .. } => stream,
            _ => None,
        }
    }
}
