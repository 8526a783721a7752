//! TCP echo server.
//!
//! Serves one client at a time. Every blocking step (accept, read) is bounded
//! by [`POLL_INTERVAL`] and raced against the shutdown latch, so a shutdown
//! request is noticed promptly whether the server is idle or mid-session.
//! Writes are never raced: a chunk that has been read is always echoed in
//! full before the latch is consulted again.

use crate::notify::Notifier;
use crate::signal::SignalLatch;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Maximum bytes read from a client in one read.
pub const CHUNK_SIZE: usize = 16;

/// Upper bound on any single accept or read wait.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pending-connection queue length for the listening socket.
const LISTEN_BACKLOG: i32 = 1;

/// Where the accept loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for a client.
    Listening,
    /// Echoing for the single connected client.
    Serving,
    /// Shutdown observed; listener is about to close.
    Stopped,
}

/// How a client session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Client closed its side of the stream.
    EndOfStream,
    /// The shutdown latch was set while the session was open.
    Shutdown,
    /// Read or write failed; only this session is affected.
    Failed(io::Error),
}

/// Counters reported when the server stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub connections: u64,
    pub bytes_echoed: u64,
}

/// Errors that stop the server.
#[derive(Debug)]
pub enum ServerError {
    Resolve {
        host: String,
        port: u16,
        source: io::Error,
    },
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },
    Accept(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Resolve { host, port, source } => {
                write!(f, "Failed to resolve '{host}:{port}': {source}")
            }
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to bind {addr}: {source}")
            }
            ServerError::Accept(e) => write!(f, "Failed to accept connection: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Resolve { source, .. } => Some(source),
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Accept(e) => Some(e),
        }
    }
}

/// Server instance. Owns the listening socket for its whole lifetime.
pub struct EchoServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: ServerState,
    stats: ServerStats,
}

impl EchoServer {
    /// Resolve `host` and bind the listening socket.
    ///
    /// When the host resolves to several addresses the first IPv4 one is
    /// used, falling back to the first address of any family.
    pub async fn bind(host: &str, port: u16) -> Result<Self, ServerError> {
        let resolve_err = |source| ServerError::Resolve {
            host: host.to_string(),
            port,
            source,
        };

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(resolve_err)?
            .collect();
        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                resolve_err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "host resolved to no addresses",
                ))
            })?;

        let bind_err = |source| ServerError::Bind { addr, source };
        let listener = TcpListener::from_std(create_listener(addr).map_err(bind_err)?)
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!(address = %local_addr, "Starting up");

        Ok(Self {
            listener,
            local_addr,
            state: ServerState::Listening,
            stats: ServerStats::default(),
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg(test)]
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Accept and echo until `latch` is set.
    ///
    /// Returns the session counters on graceful shutdown. Only listener
    /// failures are returned as errors; per-connection failures are logged
    /// and the server goes back to listening.
    pub async fn run(
        mut self,
        latch: Arc<SignalLatch>,
        notifier: Notifier,
    ) -> Result<ServerStats, ServerError> {
        notifier.ready();
        info!(address = %self.local_addr, "Ready for connection");

        while !latch.is_shutting_down() {
            let Some((stream, peer)) = self.accept(&latch).await? else {
                continue;
            };

            self.stats.connections += 1;
            self.transition(ServerState::Serving);
            info!(peer = %peer, "Connection from");

            match self.serve(stream, peer, &latch).await {
                SessionEnd::EndOfStream => info!(peer = %peer, "No more data"),
                SessionEnd::Shutdown => info!(peer = %peer, "Closing connection for shutdown"),
                SessionEnd::Failed(e) => warn!(peer = %peer, error = %e, "Connection error"),
            }

            self.transition(ServerState::Listening);
            if !latch.is_shutting_down() {
                info!("Ready for connection");
            }
        }

        notifier.stopping();
        self.transition(ServerState::Stopped);
        info!(
            connections = self.stats.connections,
            bytes_echoed = self.stats.bytes_echoed,
            "Echo server stopping"
        );

        Ok(self.stats)
    }

    /// Wait up to one poll interval for a client.
    ///
    /// `Ok(None)` means the wait timed out or shutdown was requested; the
    /// caller re-checks the latch either way.
    async fn accept(
        &self,
        latch: &SignalLatch,
    ) -> Result<Option<(TcpStream, SocketAddr)>, ServerError> {
        tokio::select! {
            biased;
            _ = latch.wait() => Ok(None),
            accepted = timeout(POLL_INTERVAL, self.listener.accept()) => match accepted {
                Ok(Ok(conn)) => Ok(Some(conn)),
                Ok(Err(e)) => Err(ServerError::Accept(e)),
                Err(_) => {
                    trace!("Accept timed out");
                    Ok(None)
                }
            },
        }
    }

    /// Echo one client's bytes back in chunks of at most [`CHUNK_SIZE`].
    ///
    /// The stream is owned here and dropped on every return path.
    async fn serve(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
        latch: &SignalLatch,
    ) -> SessionEnd {
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            let n = tokio::select! {
                biased;
                _ = latch.wait() => return SessionEnd::Shutdown,
                read = timeout(POLL_INTERVAL, stream.read(&mut chunk)) => match read {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return SessionEnd::Failed(e),
                    Err(_) => {
                        trace!(peer = %peer, "Read timed out");
                        continue;
                    }
                },
            };

            let data = &chunk[..n];
            info!(peer = %peer, len = n, data = %data.escape_ascii(), "Received");
            if n == 0 {
                return SessionEnd::EndOfStream;
            }

            if let Err(e) = stream.write_all(data).await {
                return SessionEnd::Failed(e);
            }
            self.stats.bytes_echoed += n as u64;
            info!(peer = %peer, len = n, "Sent data back to the client");
        }
    }

    fn transition(&mut self, next: ServerState) {
        debug!(from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
