//! A framed TCP connection bridged to an [`Agent`] through bounded queues.
//!
//! Once served, each connection runs three tasks:
//!
//! - **read**: pulls packets off the socket with the [`Protocol`] and pushes
//!   them onto the inbound queue, waiting when the queue is full.
//! - **dispatch**: pops inbound packets in arrival order and hands each to
//!   [`Agent::on_message`].
//! - **write**: pops outbound packets in enqueue order and writes them with
//!   the [`Protocol`].
//!
//! A supervisor task joins the three. The first one to finish (or fail)
//! triggers [`Connection::close`]; errors are reported to
//! [`Agent::on_error`] while the connection is still open.
//!
//! Lifecycle:
//!
//! ```text
//! Init --serve()--> Serving --close()--> Closed
//!   \_______________close()_____________/
//! ```

use crate::agent::Agent;
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::protocol::Protocol;
use socket2::SockRef;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, trace, Instrument, Span};

/// Capacity of the inbound (read → dispatch) queue.
pub const READ_QUEUE_SIZE: usize = 100;

/// Capacity of the outbound (caller → write) queue.
pub const WRITE_QUEUE_SIZE: usize = 100;

/// How long the write loop keeps flushing queued packets after close.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

const STATE_INIT: u8 = 0;
const STATE_SERVING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Constructed, loops not started.
    Init,
    /// Loops running.
    Serving,
    /// Terminal.
    Closed,
}

type ExtraData = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// One live TCP connection.
pub struct Connection {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    agent: Option<Arc<dyn Agent>>,
    protocol: Option<Arc<dyn Protocol>>,
    /// Duplicate handle of the socket, used to shut it down on close.
    socket: socket2::Socket,
    reader: tokio::sync::Mutex<Option<BufReader<OwnedReadHalf>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    outbound: mpsc::Sender<Packet>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    /// Deadlines in nanoseconds, zero = none.
    read_deadline: AtomicU64,
    write_deadline: AtomicU64,
    state: AtomicU8,
    exit: CancellationToken,
    closed_at: OnceLock<Instant>,
    extra: RwLock<Option<ExtraData>>,
    span: Span,
}

impl Connection {
    /// Wrap a connected stream.
    ///
    /// Either collaborator may be missing here; [`Connection::serve`] will
    /// refuse to start without both. [`Connection::read_packet`] only needs
    /// the protocol.
    pub fn new(
        stream: TcpStream,
        agent: Option<Arc<dyn Agent>>,
        protocol: Option<Arc<dyn Protocol>>,
    ) -> Result<Arc<Self>> {
        Self::with_parent_span(stream, agent, protocol, &Span::current())
    }

    pub(crate) fn with_parent_span(
        stream: TcpStream,
        agent: Option<Arc<dyn Agent>>,
        protocol: Option<Arc<dyn Protocol>>,
        parent: &Span,
    ) -> Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let socket = SockRef::from(&stream).try_clone()?;
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(WRITE_QUEUE_SIZE);

        Ok(Arc::new(Self {
            peer_addr,
            local_addr,
            agent,
            protocol,
            socket,
            reader: tokio::sync::Mutex::new(Some(BufReader::new(read_half))),
            writer: Mutex::new(Some(write_half)),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            read_deadline: AtomicU64::new(0),
            write_deadline: AtomicU64::new(0),
            state: AtomicU8::new(STATE_INIT),
            exit: CancellationToken::new(),
            closed_at: OnceLock::new(),
            extra: RwLock::new(None),
            span: debug_span!(parent: parent, "conn", peer = %peer_addr),
        }))
    }

    /// Start the read, dispatch and write loops.
    ///
    /// Fails with [`Error::MissingAgentOrProtocol`] (closing the connection)
    /// when either collaborator is missing. Must be called from within a
    /// Tokio runtime.
    pub fn serve(self: &Arc<Self>) -> Result<()> {
        let (agent, protocol) = match (&self.agent, &self.protocol) {
            (Some(agent), Some(protocol)) => (Arc::clone(agent), Arc::clone(protocol)),
            _ => {
                self.close();
                return Err(Error::MissingAgentOrProtocol);
            }
        };

        match self.state.compare_exchange(
            STATE_INIT,
            STATE_SERVING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_CLOSED) => return Err(Error::ConnectionClosed),
            Err(_) => return Err(Error::AlreadyServing),
        }

        let reader = self.reader.try_lock().ok().and_then(|mut slot| slot.take());
        let writer = lock(&self.writer).take();
        let outbound_rx = lock(&self.outbound_rx).take();
        let (reader, writer, outbound_rx) = match (reader, writer, outbound_rx) {
            (Some(r), Some(w), Some(rx)) => (r, w, rx),
            _ => {
                // A direct read_packet call holds the read half.
                self.close();
                return Err(Error::AlreadyServing);
            }
        };

        debug!(parent: &self.span, "Connection serving");
        if panic::catch_unwind(AssertUnwindSafe(|| agent.on_connected(self))).is_err() {
            error!(parent: &self.span, "Agent panicked in on_connected");
            self.close();
            return Err(Error::AgentPanicked {
                callback: "on_connected",
            });
        }

        let conn = Arc::clone(self);
        tokio::spawn(
            conn.supervise(agent, protocol, reader, writer, outbound_rx)
                .instrument(self.span.clone()),
        );
        Ok(())
    }

    async fn supervise(
        self: Arc<Self>,
        agent: Arc<dyn Agent>,
        protocol: Arc<dyn Protocol>,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        outbound_rx: mpsc::Receiver<Packet>,
    ) {
        let (inbound, inbound_rx) = mpsc::channel(READ_QUEUE_SIZE);
        let span = Span::current();

        let mut loops = JoinSet::new();
        loops.spawn(
            Arc::clone(&self)
                .read_loop(Arc::clone(&protocol), reader, inbound)
                .instrument(span.clone()),
        );
        loops.spawn(
            Arc::clone(&self)
                .dispatch_loop(Arc::clone(&agent), inbound_rx)
                .instrument(span.clone()),
        );
        loops.spawn(
            Arc::clone(&self)
                .write_loop(protocol, writer, outbound_rx)
                .instrument(span),
        );

        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) if self.is_closed() => {
                    debug!(error = %e, "Error after close");
                }
                Ok(Err(e)) => agent.on_error(&e),
                Err(e) => error!(error = %e, "Connection task failed"),
            }
            self.close();
        }

        trace!("Connection loops finished");
    }

    async fn read_loop(
        self: Arc<Self>,
        protocol: Arc<dyn Protocol>,
        mut reader: BufReader<OwnedReadHalf>,
        inbound: mpsc::Sender<Packet>,
    ) -> Result<()> {
        loop {
            let read = tokio::select! {
                _ = self.exit.cancelled() => return Ok(()),
                read = self.read_with_deadline(protocol.as_ref(), &mut reader) => read,
            };

            let packet = match read {
                Ok(packet) => packet,
                Err(Error::Eof) => {
                    debug!("Connection closed by peer");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            trace!(kind = packet.kind(), len = packet.len(), "Packet received");

            tokio::select! {
                _ = self.exit.cancelled() => return Ok(()),
                sent = inbound.send(packet) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        agent: Arc<dyn Agent>,
        mut inbound: mpsc::Receiver<Packet>,
    ) -> Result<()> {
        let mut closing = false;
        loop {
            tokio::select! {
                biased;
                _ = self.exit.cancelled(), if !closing => {
                    inbound.close();
                    closing = true;
                }
                packet = inbound.recv() => match packet {
                    Some(packet) => agent.on_message(&self, packet),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        protocol: Arc<dyn Protocol>,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::Receiver<Packet>,
    ) -> Result<()> {
        let mut closing = false;
        loop {
            let packet = tokio::select! {
                biased;
                _ = self.exit.cancelled(), if !closing => {
                    outbound.close();
                    closing = true;
                    continue;
                }
                packet = outbound.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };

            tokio::select! {
                written = self.write_with_deadline(protocol.as_ref(), &mut writer, &packet) => {
                    written?;
                    trace!(kind = packet.kind(), len = packet.len(), "Packet sent");
                }
                _ = self.linger_expired() => {
                    debug!(dropped = outbound.len(), "Linger expired, dropping queued packets");
                    break;
                }
            }
        }

        if let Err(e) = writer.shutdown().await {
            trace!(error = %e, "Write shutdown failed");
        }
        Ok(())
    }

    async fn read_with_deadline(
        &self,
        protocol: &dyn Protocol,
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<Packet> {
        match self.read_deadline() {
            Some(deadline) => tokio::time::timeout(deadline, protocol.read_packet(reader))
                .await
                .map_err(|_| deadline_exceeded("read"))?,
            None => protocol.read_packet(reader).await,
        }
    }

    async fn write_with_deadline(
        &self,
        protocol: &dyn Protocol,
        writer: &mut OwnedWriteHalf,
        packet: &Packet,
    ) -> Result<()> {
        match self.write_deadline() {
            Some(deadline) => tokio::time::timeout(deadline, protocol.write_packet(writer, packet))
                .await
                .map_err(|_| deadline_exceeded("write"))?,
            None => protocol.write_packet(writer, packet).await,
        }
    }

    /// Completes [`CLOSE_LINGER`] after the connection closed.
    async fn linger_expired(&self) {
        self.exit.cancelled().await;
        let closed_at = self.closed_at.get().copied().unwrap_or_else(Instant::now);
        tokio::time::sleep_until(closed_at + CLOSE_LINGER).await;
    }

    /// Read one packet directly from the socket, bypassing the loops.
    ///
    /// For callers driving their own read cadence instead of calling
    /// [`Connection::serve`]. Fails with [`Error::AlreadyServing`] once the
    /// read loop owns the socket.
    pub async fn read_packet(&self) -> Result<Packet> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let protocol = self.protocol.as_ref().ok_or(Error::MissingAgentOrProtocol)?;
        let mut slot = self.reader.lock().await;
        let reader = slot.as_mut().ok_or(Error::AlreadyServing)?;
        self.read_with_deadline(protocol.as_ref(), reader).await
    }

    /// Queue a packet for sending without waiting.
    ///
    /// Fails with [`Error::BufferFull`] when the outbound queue is at
    /// capacity; the connection stays open.
    pub fn write_packet(&self, packet: Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.outbound.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => Error::BufferFull,
            TrySendError::Closed(_) => Error::ConnectionClosed,
        })
    }

    /// Queue a packet, waiting up to `timeout` for space.
    pub async fn write_packet_with_timeout(&self, packet: Packet, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        match tokio::time::timeout(timeout, self.outbound.send(packet)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::WriteTimeout),
        }
    }

    /// Close the connection. Only the first call has any effect.
    ///
    /// Stops the read loop, lets the dispatch and write loops drain what is
    /// already queued, and notifies the agent. Queued outbound packets are
    /// flushed for at most [`CLOSE_LINGER`] and are not guaranteed to reach
    /// the peer.
    pub fn close(self: &Arc<Self>) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev == STATE_CLOSED {
            return;
        }
        debug!(parent: &self.span, "Closing connection");

        let _ = self.closed_at.set(Instant::now());
        self.exit.cancel();

        if let Some(agent) = &self.agent {
            agent.on_disconnected(self);
        }

        // The write loop shuts down the sending side once drained.
        let how = if prev == STATE_SERVING {
            Shutdown::Read
        } else {
            // Wake senders blocked on a queue nothing will drain.
            drop(lock(&self.outbound_rx).take());
            Shutdown::Both
        };
        if let Err(e) = self.socket.shutdown(how) {
            trace!(parent: &self.span, error = %e, "Socket shutdown failed");
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            STATE_INIT => ConnState::Init,
            STATE_SERVING => ConnState::Serving,
            _ => ConnState::Closed,
        }
    }

    /// True once [`Connection::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Apply `deadline` to every subsequent socket read. Zero disables it.
    pub fn set_read_deadline(&self, deadline: Duration) {
        self.read_deadline.store(as_nanos(deadline), Ordering::Relaxed);
    }

    /// Apply `deadline` to every subsequent socket write. Zero disables it.
    pub fn set_write_deadline(&self, deadline: Duration) {
        self.write_deadline.store(as_nanos(deadline), Ordering::Relaxed);
    }

    pub fn read_deadline(&self) -> Option<Duration> {
        from_nanos(self.read_deadline.load(Ordering::Relaxed))
    }

    pub fn write_deadline(&self) -> Option<Duration> {
        from_nanos(self.write_deadline.load(Ordering::Relaxed))
    }

    /// Attach caller state under `key`, replacing any previous value.
    pub fn set_extra_data<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        let mut extra = self.extra.write().unwrap_or_else(PoisonError::into_inner);
        extra
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), Arc::new(value));
    }

    /// Fetch caller state stored under `key`, if present and of type `T`.
    pub fn extra_data<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let extra = self.extra.read().unwrap_or_else(PoisonError::into_inner);
        let value = extra.as_ref()?.get(key)?.clone();
        value.downcast::<T>().ok()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_addr.ip()
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local_addr.ip()
    }

    /// Registry key: the peer address as a string.
    pub fn key(&self) -> String {
        self.peer_addr.to_string()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn deadline_exceeded(op: &str) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{op} deadline exceeded"),
    ))
}

fn as_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn from_nanos(nanos: u64) -> Option<Duration> {
    (nanos > 0).then(|| Duration::from_nanos(nanos))
}
