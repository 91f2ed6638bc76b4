//! TCP server: owns the listener, runs the accept loop and the registry
//! reaper, and wires every accepted or opened socket to an agent and a
//! protocol.

use crate::agent::Agent;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::Protocol;
use crate::registry::{reap_task, Registry};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// First delay after a transient accept error.
pub const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound on the accept retry delay.
pub const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Listen backlog.
const BACKLOG: i32 = 1024;

/// Exponential backoff for transient accept failures.
///
/// Delays run 5ms, 10ms, 20ms, ... capped at 1s, and start over after
/// [`AcceptBackoff::reset`].
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    delay: Duration,
}

impl AcceptBackoff {
    /// Delay to wait before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            MIN_ACCEPT_BACKOFF
        } else {
            (self.delay * 2).min(MAX_ACCEPT_BACKOFF)
        };
        self.delay
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }
}

/// Whether an accept error is worth retrying.
///
/// Covers aborted handshakes, interrupts, and resource exhaustion such as
/// running out of file descriptors.
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    #[cfg(unix)]
    {
        matches!(
            err.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO)
        )
    }

    #[cfg(not(unix))]
    {
        false
    }
}

struct Shared {
    addr: String,
    agent: Arc<dyn Agent>,
    protocol: Arc<dyn Protocol>,
    read_deadline: RwLock<Duration>,
    write_deadline: RwLock<Duration>,
    exit: CancellationToken,
    registry: Arc<Registry>,
    local_addr: OnceLock<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<Result<()>>>>,
    span: Span,
}

/// A TCP server. Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Create a server for `addr` (`host:port`) with default collaborators.
    pub fn new(addr: impl Into<String>, agent: Arc<dyn Agent>, protocol: Arc<dyn Protocol>) -> Self {
        let addr = addr.into();
        let span = info_span!("server", addr = %addr);
        Server {
            shared: Arc::new(Shared {
                addr,
                agent,
                protocol,
                read_deadline: RwLock::new(Duration::ZERO),
                write_deadline: RwLock::new(Duration::ZERO),
                exit: CancellationToken::new(),
                registry: Arc::new(Registry::new()),
                local_addr: OnceLock::new(),
                accept_task: Mutex::new(None),
                span,
            }),
        }
    }

    /// Bind the listener and start the accept loop and reaper.
    ///
    /// Returns as soon as the socket is bound, with the bound address. Use
    /// [`Server::wait`] to block on the accept loop.
    pub async fn listen_and_serve(&self) -> Result<SocketAddr> {
        let shared = &self.shared;
        if shared.local_addr.get().is_some() {
            return Err(Error::AlreadyServing);
        }

        let addr = resolve_ipv4(&shared.addr).await?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;
        let local_addr = listener.local_addr()?;
        if shared.local_addr.set(local_addr).is_err() {
            return Err(Error::AlreadyServing);
        }

        info!(parent: &shared.span, address = %local_addr, "Server listening");

        tokio::spawn(
            reap_task(Arc::clone(&shared.registry), shared.exit.clone())
                .instrument(shared.span.clone()),
        );
        let accept = tokio::spawn(
            Arc::clone(shared)
                .accept_loop(listener)
                .instrument(shared.span.clone()),
        );
        *lock(&shared.accept_task) = Some(accept);

        Ok(local_addr)
    }

    /// Open an outbound connection and serve it like an accepted one.
    ///
    /// `agent` and `protocol` default to the server's own.
    pub async fn connect(
        &self,
        addr: &str,
        agent: Option<Arc<dyn Agent>>,
        protocol: Option<Arc<dyn Protocol>>,
    ) -> Result<Arc<Connection>> {
        let target = resolve_ipv4(addr).await?;
        let stream = TcpStream::connect(target).await?;
        debug!(parent: &self.shared.span, peer = %target, "Connected");
        self.shared.attach(stream, agent, protocol)
    }

    /// Stop accepting, then close every tracked connection.
    ///
    /// Does not wait for connection loops to drain.
    pub fn close(&self) {
        let shared = &self.shared;
        info!(parent: &shared.span, "Closing server");

        shared.exit.cancel();
        for conn in shared.registry.get_all() {
            if !conn.is_closed() {
                conn.close();
            }
        }
    }

    /// Wait for the accept loop to end.
    ///
    /// Returns the error that stopped it, if any.
    pub async fn wait(&self) -> Result<()> {
        let accept = lock(&self.shared.accept_task).take();
        match accept {
            Some(handle) => handle.await.map_err(|e| Error::Io(io::Error::other(e)))?,
            None => Ok(()),
        }
    }

    /// All tracked connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.registry.get_all()
    }

    /// A tracked connection by peer address string.
    pub fn connection(&self, key: &str) -> Option<Arc<Connection>> {
        self.shared.registry.get(key)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    /// Bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.get().copied()
    }

    /// Read deadline for connections set up from now on.
    pub fn set_read_deadline(&self, deadline: Duration) {
        *self
            .shared
            .read_deadline
            .write()
            .unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    /// Write deadline for connections set up from now on.
    pub fn set_write_deadline(&self, deadline: Duration) {
        *self
            .shared
            .write_deadline
            .write()
            .unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    pub fn read_deadline(&self) -> Duration {
        self.shared.read_deadline()
    }

    pub fn write_deadline(&self) -> Duration {
        self.shared.write_deadline()
    }
}

impl Shared {
    fn read_deadline(&self) -> Duration {
        *self.read_deadline.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_deadline(&self) -> Duration {
        *self.write_deadline.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut backoff = AcceptBackoff::default();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.exit.cancelled() => {
                    info!("Listener closed");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            if let Some(delay) = self.on_accept(accepted, &mut backoff)? {
                tokio::select! {
                    _ = self.exit.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    /// Handle one accept outcome. Returns how long to back off, if at all.
    fn on_accept(
        &self,
        accepted: io::Result<(TcpStream, SocketAddr)>,
        backoff: &mut AcceptBackoff,
    ) -> Result<Option<Duration>> {
        match accepted {
            Ok((stream, peer)) => {
                backoff.reset();
                debug!(peer = %peer, "Accepted connection");
                if let Err(e) = self.attach(stream, None, None) {
                    warn!(peer = %peer, error = %e, "Failed to set up connection");
                }
                Ok(None)
            }
            Err(e) if is_transient(&e) => {
                let delay = backoff.next_delay();
                warn!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Accept failed, retrying"
                );
                Ok(Some(delay))
            }
            Err(e) => {
                error!(error = %e, "Accept failed, stopping listener");
                Err(e.into())
            }
        }
    }

    /// Common setup for accepted and opened sockets.
    fn attach(
        &self,
        stream: TcpStream,
        agent: Option<Arc<dyn Agent>>,
        protocol: Option<Arc<dyn Protocol>>,
    ) -> Result<Arc<Connection>> {
        if self.exit.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let agent = agent.unwrap_or_else(|| Arc::clone(&self.agent));
        let protocol = protocol.unwrap_or_else(|| Arc::clone(&self.protocol));

        let conn = Connection::with_parent_span(stream, Some(agent), Some(protocol), &self.span)?;
        conn.set_read_deadline(self.read_deadline());
        conn.set_write_deadline(self.write_deadline());
        conn.serve()?;
        self.registry.put(conn.key(), Arc::clone(&conn));

        // Raced with Server::close after its snapshot of the registry.
        if self.exit.is_cancelled() {
            conn.close();
            return Err(Error::ConnectionClosed);
        }
        Ok(conn)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve `addr` to its first IPv4 endpoint.
async fn resolve_ipv4(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| Error::AddrResolve {
            addr: addr.to_string(),
        })
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
