use std::{
    collections::HashMap,
    fmt,
    net::{SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
    },
    time::{Duration, Instant},
};

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, instrument, trace, warn};

use crate::{
    backend::BackendHandles,
    buffer::CycleBuffer,
    codec::{Frame, FrameCodec, FrameRef},
    config::ConnectionConfig,
    context::TlsContext,
    error::IoError,
    msg_id::MsgId,
    socket,
    state::{State, StateError},
    transport::{PlainTransport, TlsTransport, Transport},
    Role,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Process unique identifier of a connection, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the numeric value of the identifier.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connection routing all bytes through a TLS session.
pub type TlsConnection = Connection<TlsTransport>;

/// A connection to a single peer.
///
/// A connection is meant to be shared between worker threads, e.g. behind an
/// [`Arc`]. Sends are serialized so that every message reaches the wire in
/// one piece. Receives on distinct [`MsgId`]s proceed independently: whichever
/// receiver finds the socket idle pulls frames off it and hands them to the
/// buffer of their identifier, while the other receivers wait on their own
/// buffer.
///
/// Receiving on the same identifier from several threads at once is not
/// supported.
pub struct Connection<T: Transport = PlainTransport> {
    id: ConnectionId,
    role: Role,
    peer_addr: SocketAddr,
    transport: T,
    config: ConnectionConfig,
    state: Mutex<State>,
    sender: Mutex<Sender>,
    sends_in_flight: AtomicUsize,
    reader: Mutex<Demux>,
    default_buffer: Arc<CycleBuffer>,
    buffers: Mutex<HashMap<MsgId, Arc<CycleBuffer>>>,
    backend: Mutex<BackendHandles>,
}

/// Outbound half, owned by whoever holds the send lock.
struct Sender {
    codec: FrameCodec,
    frame: BytesMut,
}

/// Inbound half, owned by the receiver currently pulling from the socket.
struct Demux {
    codec: FrameCodec,
    // Bytes of a frame which did not completely arrive yet.
    pending: BytesMut,
    scratch: Vec<u8>,
}

/// Decrements the in-flight counter once a send is over.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Connection<PlainTransport> {
    /// Creates a plain TCP connection over a connected socket.
    pub fn new(stream: TcpStream, role: Role) -> Result<Self, IoError> {
        Self::with_config(stream, role, ConnectionConfig::default())
    }

    /// Creates a plain TCP connection with the given tunables.
    pub fn with_config(
        stream: TcpStream,
        role: Role,
        config: ConnectionConfig,
    ) -> Result<Self, IoError> {
        Self::from_transport(PlainTransport::new(stream)?, role, config)
    }
}

impl Connection<TlsTransport> {
    /// Creates a TLS connection over a connected socket.
    ///
    /// The session is established by [`handshake`](Self::handshake).
    pub fn new_tls(
        stream: TcpStream,
        role: Role,
        context: Arc<TlsContext>,
    ) -> Result<Self, IoError> {
        Self::tls_with_config(stream, role, context, ConnectionConfig::default())
    }

    /// Creates a TLS connection with the given tunables.
    pub fn tls_with_config(
        stream: TcpStream,
        role: Role,
        context: Arc<TlsContext>,
        config: ConnectionConfig,
    ) -> Result<Self, IoError> {
        Self::from_transport(TlsTransport::new(stream, context)?, role, config)
    }
}

impl<T: Transport> Connection<T> {
    /// Creates a connection over an arbitrary transport.
    pub fn from_transport(
        transport: T,
        role: Role,
        config: ConnectionConfig,
    ) -> Result<Self, IoError> {
        let id = ConnectionId::next();
        let peer_addr = transport.peer_addr()?;
        let max_frame_length = config.max_frame_length();

        debug!(conn = %id, %role, peer = %peer_addr, "created connection");

        Ok(Self {
            id,
            role,
            peer_addr,
            transport,
            sender: Mutex::new(Sender {
                codec: FrameCodec::new(max_frame_length),
                frame: BytesMut::new(),
            }),
            reader: Mutex::new(Demux {
                codec: FrameCodec::new(max_frame_length),
                pending: BytesMut::new(),
                scratch: vec![0; config.read_chunk_size()],
            }),
            config,
            state: Mutex::new(State::Invalid),
            sends_in_flight: AtomicUsize::new(0),
            default_buffer: Arc::new(CycleBuffer::new()),
            buffers: Mutex::new(HashMap::new()),
            backend: Mutex::new(BackendHandles::default()),
        })
    }

    /// Returns the identifier of the connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the side of the connection this party is on.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns `true` if the connection was accepted.
    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    /// Returns the address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Returns the current state.
    pub fn state(&self) -> State {
        *self.lock_state()
    }

    /// Returns the number of sends currently writing or waiting for the send
    /// lock.
    pub fn sends_in_flight(&self) -> usize {
        self.sends_in_flight.load(Ordering::SeqCst)
    }

    /// Returns the tunables of the connection.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Attaches the handles of the backend driving this connection.
    pub fn attach_backend(&self, handles: BackendHandles) {
        *self.backend.lock().unwrap_or_else(PoisonError::into_inner) = handles;
    }

    /// Returns the attached backend handles.
    pub fn backend(&self) -> BackendHandles {
        self.backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sets the connection up for application data.
    ///
    /// Calling this on a connection which completed its handshake returns
    /// immediately. If the handshake fails, including by running out of time,
    /// the connection is failed.
    #[instrument(level = "debug", skip_all, fields(conn = %self.id, role = %self.role), err)]
    pub fn handshake(&self, timeout: Option<Duration>) -> Result<(), IoError> {
        let deadline = socket::deadline(timeout);
        // Nothing may be written while the session is set up.
        let _sender = self.lock_sender();

        {
            let mut state = self.lock_state();
            match *state {
                State::Handshaked | State::Connected => return Ok(()),
                State::Invalid => {}
                state => {
                    return Err(StateError::Unusable {
                        op: "handshake",
                        state,
                    }
                    .into())
                }
            }

            if self.role == Role::Client {
                state.transition(State::Connecting)?;
            }
            state.transition(State::Handshaking)?;
        }

        if let Err(err) = self.transport.handshake(self.role, deadline) {
            warn!(%err, "handshake failed");
            self.fail(&err);
            return Err(err);
        }

        let mut state = self.lock_state();
        state.transition(State::Handshaked)?;
        state.transition(State::Connected)?;
        debug!(peer = %self.peer_addr, "connected");

        Ok(())
    }

    /// Closes the connection.
    ///
    /// The transport is shut down and all blocked receivers are woken up.
    /// Closing a closed connection does nothing, closing a failed connection
    /// releases its resources but leaves it failed.
    #[instrument(level = "debug", skip_all, fields(conn = %self.id))]
    pub fn close(&self) {
        let failed = {
            let mut state = self.lock_state();
            match *state {
                State::Closing | State::Closed => return,
                State::Failed => true,
                _ => {
                    if let Err(err) = state.transition(State::Closing) {
                        debug!(%err, "unexpected state on close");
                        return;
                    }
                    false
                }
            }
        };

        if let Err(err) = self.transport.shutdown() {
            debug!(%err, "transport shutdown failed");
        }

        if !failed {
            match self.lock_state().transition(State::Closed) {
                Ok(_) => debug!("closed"),
                Err(err) => debug!(%err, "connection changed state while closing"),
            }
        }

        self.wake_all();
    }

    /// Sends `data` on the untagged channel.
    ///
    /// Returns the number of bytes sent, which is always `data.len()`.
    pub fn send(&self, data: &[u8], timeout: Option<Duration>) -> Result<usize, IoError> {
        self.send_frame(None, data, timeout)
    }

    /// Sends `data` to the receiver of `id`.
    ///
    /// Returns the number of bytes sent, which is always `data.len()`.
    pub fn send_tagged(
        &self,
        id: &MsgId,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, IoError> {
        id.validate()?;
        self.send_frame(Some(id), data, timeout)
    }

    /// Receives exactly `data.len()` bytes from the untagged channel.
    pub fn recv(&self, data: &mut [u8], timeout: Option<Duration>) -> Result<usize, IoError> {
        let buffer = self.default_buffer.clone();
        self.receive("recv", &buffer, data.len(), timeout, |buffer| {
            buffer.read(data).then_some(data.len())
        })
    }

    /// Receives exactly `data.len()` bytes sent to `id`.
    pub fn recv_tagged(
        &self,
        id: &MsgId,
        data: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, IoError> {
        id.validate()?;
        let buffer = self.buffer(id);
        self.receive("recv", &buffer, data.len(), timeout, |buffer| {
            buffer.read(data).then_some(data.len())
        })
    }

    /// Copies bytes of the untagged channel into `buf` without consuming
    /// them.
    ///
    /// Blocks until at least one byte is available and returns how many bytes
    /// were copied.
    pub fn peek(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, IoError> {
        if buf.is_empty() {
            self.ensure_usable("peek")?;
            return Ok(0);
        }

        let buffer = self.default_buffer.clone();
        self.receive("peek", &buffer, 1, timeout, |buffer| {
            let n = buffer.peek(buf);
            (n > 0).then_some(n)
        })
    }

    fn send_frame(
        &self,
        id: Option<&MsgId>,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, IoError> {
        let deadline = socket::deadline(timeout);
        let _in_flight = InFlight::enter(&self.sends_in_flight);

        if data.len() > self.config.max_frame_length() {
            return Err(IoError::misuse(format!(
                "message of {} bytes exceeds the frame limit of {} bytes",
                data.len(),
                self.config.max_frame_length()
            )));
        }

        let mut sender = self.lock_sender();
        self.ensure_usable("send")?;

        let Sender { codec, frame } = &mut *sender;
        frame.clear();
        codec.encode(FrameRef { id, payload: data }, frame)?;

        let mut written = 0;
        match socket::write_tracked(&self.transport, &frame[..], deadline, &mut written) {
            Ok(()) => {
                trace!(conn = %self.id, id = ?id, len = data.len(), "sent frame");
                Ok(data.len())
            }
            Err(err) => {
                // A partially written frame desynchronizes the peer.
                if !err.is_timeout() || written > 0 {
                    self.fail(&err);
                }
                Err(err)
            }
        }
    }

    /// Blocks until `take` succeeds on `buffer`, pulling frames off the
    /// socket whenever no other receiver does.
    fn receive<R>(
        &self,
        op: &'static str,
        buffer: &CycleBuffer,
        want: usize,
        timeout: Option<Duration>,
        mut take: impl FnMut(&CycleBuffer) -> Option<R>,
    ) -> Result<R, IoError> {
        let deadline = socket::deadline(timeout);
        self.ensure_usable(op)?;

        loop {
            if let Some(taken) = take(buffer) {
                return Ok(taken);
            }

            self.ensure_usable(op)?;
            socket::remaining(deadline)?;

            let demux = match self.reader.try_lock() {
                Ok(demux) => Some(demux),
                Err(TryLockError::Poisoned(err)) => Some(err.into_inner()),
                Err(TryLockError::WouldBlock) => None,
            };

            match demux {
                Some(mut demux) => {
                    let result = self.pump(&mut demux, deadline);
                    drop(demux);
                    // Let waiting receivers check their buffer or take over.
                    self.wake_all();

                    match result {
                        Ok(()) => {}
                        Err(err) if err.is_timeout() => {}
                        Err(err) => {
                            if let Some(taken) = take(buffer) {
                                return Ok(taken);
                            }
                            self.fail(&err);
                            return Err(err);
                        }
                    }
                }
                None => {
                    let poll = Instant::now() + self.config.wait_interval();
                    let until = match deadline {
                        Some(deadline) => deadline.min(poll),
                        None => poll,
                    };
                    buffer.wait(want, Some(until));
                }
            }
        }
    }

    /// Pulls the bytes available on the socket and routes complete frames.
    fn pump(&self, demux: &mut Demux, deadline: Option<Instant>) -> Result<(), IoError> {
        let Demux {
            codec,
            pending,
            scratch,
        } = demux;

        let n = socket::peek(&self.transport, scratch, deadline)?;
        // The bytes are readable already, so this does not block.
        socket::readn(&self.transport, &mut scratch[..n], None)?;
        pending.extend_from_slice(&scratch[..n]);

        while let Some(frame) = codec.decode(pending)? {
            self.route(frame);
        }

        Ok(())
    }

    fn route(&self, frame: Frame) {
        let buffer = match &frame.id {
            Some(id) => self.buffer(id),
            None => self.default_buffer.clone(),
        };

        trace!(conn = %self.id, id = ?frame.id, len = frame.payload.len(), "routed frame");
        buffer.write(&frame.payload);
    }

    /// Returns the buffer of `id`, creating it on first use.
    fn buffer(&self, id: &MsgId) -> Arc<CycleBuffer> {
        let mut buffers = self.lock_buffers();
        if let Some(buffer) = buffers.get(id) {
            return buffer.clone();
        }

        let buffer = Arc::new(CycleBuffer::new());
        buffers.insert(id.clone(), buffer.clone());
        buffer
    }

    fn wake_all(&self) {
        self.default_buffer.wake();
        for buffer in self.lock_buffers().values() {
            buffer.wake();
        }
    }

    fn ensure_usable(&self, op: &'static str) -> Result<(), IoError> {
        let state = self.state();
        if !state.is_usable() {
            return Err(StateError::Unusable { op, state }.into());
        }
        Ok(())
    }

    /// Moves the connection to `Failed` after an unrecoverable error.
    ///
    /// A connection which is being closed is left to the closer.
    fn fail(&self, err: &IoError) {
        {
            let mut state = self.lock_state();
            if *state == State::Closing || state.is_terminal() {
                return;
            }

            match state.transition(State::Failed) {
                Ok(prev) => warn!(conn = %self.id, from = %prev, %err, "connection failed"),
                Err(err) => debug!(conn = %self.id, %err, "cannot fail connection"),
            }
        }

        self.wake_all();
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sender(&self) -> MutexGuard<'_, Sender> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_buffers(&self) -> MutexGuard<'_, HashMap<MsgId, Arc<CycleBuffer>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
