use std::{
    collections::VecDeque,
    fmt,
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError},
    time::{Duration, Instant},
};

use rustls::{ClientConnection, ServerConnection};
use tracing::{debug, trace};

use super::{plain::shutdown_stream, Transport};
use crate::{context::TlsContext, error::IoError, socket, Role};

// Upper bound for pushing close_notify to a peer which stopped reading.
const CLOSE_NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

const PLAINTEXT_CHUNK: usize = 4096;

/// Transport routing all bytes through a TLS session.
///
/// The session is created by [`Transport::handshake`] and torn down by
/// [`Transport::shutdown`]. Record layer operations are serialized by a lock
/// around the session, but waiting for ciphertext to arrive happens outside
/// of it so that a blocked reader never stalls a writer.
pub struct TlsTransport {
    stream: TcpStream,
    context: Arc<TlsContext>,
    session: Mutex<Option<Established>>,
    // Ciphertext produced by the session which has not reached the socket.
    outgoing: Mutex<Vec<u8>>,
}

enum Session {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Session {
    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            Session::Client(conn) => conn.read_tls(rd),
            Session::Server(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            Session::Client(conn) => conn.write_tls(wr),
            Session::Server(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Session::Client(conn) => conn.process_new_packets(),
            Session::Server(conn) => conn.process_new_packets(),
        }
    }

    fn complete_io<T: Read + Write>(&mut self, io: &mut T) -> io::Result<(usize, usize)> {
        match self {
            Session::Client(conn) => conn.complete_io(io),
            Session::Server(conn) => conn.complete_io(io),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Session::Client(conn) => conn.reader(),
            Session::Server(conn) => conn.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Session::Client(conn) => conn.writer(),
            Session::Server(conn) => conn.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Session::Client(conn) => conn.send_close_notify(),
            Session::Server(conn) => conn.send_close_notify(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Session::Client(conn) => conn.wants_write(),
            Session::Server(conn) => conn.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Session::Client(conn) => conn.is_handshaking(),
            Session::Server(conn) => conn.is_handshaking(),
        }
    }

    fn peer_certificates(&self) -> Option<&[rustls::Certificate]> {
        match self {
            Session::Client(conn) => conn.peer_certificates(),
            Session::Server(conn) => conn.peer_certificates(),
        }
    }
}

/// An established session together with decrypted bytes nobody consumed yet.
struct Established {
    session: Session,
    plaintext: VecDeque<u8>,
    eof: bool,
}

impl Established {
    fn new(session: Session) -> Self {
        Self {
            session,
            plaintext: VecDeque::new(),
            eof: false,
        }
    }

    fn drain_plaintext(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; PLAINTEXT_CHUNK];
        loop {
            match self.session.reader().read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => self.plaintext.extend(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn copy_out(&mut self, buf: &mut [u8], consume: bool) -> usize {
        let n = buf.len().min(self.plaintext.len());
        for (dst, src) in buf.iter_mut().zip(self.plaintext.iter()) {
            *dst = *src;
        }
        if consume {
            self.plaintext.drain(..n);
        }
        n
    }
}

impl TlsTransport {
    /// Wraps a connected socket. The session is set up by the handshake using
    /// `context`.
    pub fn new(stream: TcpStream, context: Arc<TlsContext>) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            context,
            session: Mutex::new(None),
            outgoing: Mutex::new(Vec::new()),
        })
    }

    /// Returns the underlying socket.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Returns `true` while a TLS session exists.
    pub fn is_established(&self) -> bool {
        self.lock_session().is_some()
    }

    /// Returns the certificate chain presented by the peer, if any.
    pub fn peer_certificates(&self) -> Option<Vec<rustls::Certificate>> {
        self.lock_session()
            .as_ref()
            .and_then(|established| established.session.peer_certificates())
            .map(|certs| certs.to_vec())
    }

    fn new_session(&self, role: Role) -> Result<Session, IoError> {
        let session = match role {
            Role::Server => {
                let config = self
                    .context
                    .server_config()
                    .ok_or_else(|| IoError::tls("no server identity configured"))?;
                Session::Server(ServerConnection::new(config)?)
            }
            Role::Client => {
                let config = self
                    .context
                    .client_config()
                    .ok_or_else(|| IoError::tls("no trusted roots configured"))?;
                Session::Client(ClientConnection::new(
                    config,
                    self.context.server_name().clone(),
                )?)
            }
        };

        Ok(session)
    }

    fn fetch(&self, buf: &mut [u8], consume: bool) -> io::Result<usize> {
        loop {
            {
                let mut guard = self.lock_session();
                let established = guard.as_mut().ok_or_else(not_established)?;
                established.drain_plaintext()?;
                if !established.plaintext.is_empty() {
                    return Ok(established.copy_out(buf, consume));
                }
                if established.eof {
                    return Ok(0);
                }
            }

            // Blocks until ciphertext arrives, honoring the read timeout.
            let mut byte = [0u8; 1];
            self.stream.peek(&mut byte)?;

            let mut guard = self.lock_session();
            let established = guard.as_mut().ok_or_else(not_established)?;
            let mut sock = &self.stream;
            let n = established.session.read_tls(&mut sock)?;
            if n == 0 {
                established.eof = true;
            }
            trace!(n, "read tls records");

            established
                .session
                .process_new_packets()
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        }
    }

    fn flush_outgoing(&self) -> io::Result<()> {
        self.write_outgoing(&mut self.lock_outgoing())
    }

    fn write_outgoing(&self, outgoing: &mut Vec<u8>) -> io::Result<()> {
        while !outgoing.is_empty() {
            match (&self.stream).write(outgoing) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    outgoing.drain(..n);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn deliver_close_notify(&self, outgoing: &mut Vec<u8>, close_notify: &[u8]) {
        outgoing.extend_from_slice(close_notify);
        let flushed = self
            .stream
            .set_write_timeout(Some(CLOSE_NOTIFY_TIMEOUT))
            .and_then(|_| self.write_outgoing(outgoing));
        if let Err(err) = flushed {
            debug!(%err, "failed to deliver close_notify");
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Established>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outgoing(&self) -> MutexGuard<'_, Vec<u8>> {
        self.outgoing.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_established() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "tls session is not established")
}

impl Transport for TlsTransport {
    fn read_impl(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.fetch(buf, true)
    }

    fn write_impl(&self, buf: &[u8]) -> io::Result<usize> {
        let written = {
            let mut guard = self.lock_session();
            let established = guard.as_mut().ok_or_else(not_established)?;
            let written = established.session.writer().write(buf)?;

            let mut outgoing = self.lock_outgoing();
            while established.session.wants_write() {
                established.session.write_tls(&mut *outgoing)?;
            }
            written
        };

        // Ciphertext that does not fit now is pushed out by later writes or
        // by `flush_impl`.
        match self.flush_outgoing() {
            Err(err) if !socket::is_transient(&err) => Err(err),
            _ => Ok(written),
        }
    }

    fn peek_impl(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.fetch(buf, false)
    }

    fn flush_impl(&self) -> io::Result<()> {
        self.flush_outgoing()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(timeout)
    }

    fn handshake(&self, role: Role, deadline: Option<Instant>) -> Result<(), IoError> {
        let mut session = self.new_session(role)?;
        let mut sock = &self.stream;

        while session.is_handshaking() || session.wants_write() {
            let timeout = socket::remaining(deadline)?;
            self.stream.set_read_timeout(timeout)?;
            self.stream.set_write_timeout(timeout)?;

            match session.complete_io(&mut sock) {
                Ok((rd, wr)) => trace!(rd, wr, "handshake progress"),
                Err(err) if socket::is_transient(&err) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        debug!(%role, "tls session established");
        *self.lock_session() = Some(Established::new(session));

        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        let established = self.lock_session().take();
        if let Some(mut established) = established {
            established.session.send_close_notify();

            let mut close_notify = Vec::new();
            while established.session.wants_write() {
                established.session.write_tls(&mut close_notify)?;
            }

            // A writer holding the queue may be blocked on a peer which stopped
            // reading. Only shutting the stream down releases it.
            match self.outgoing.try_lock() {
                Ok(mut outgoing) => self.deliver_close_notify(&mut outgoing, &close_notify),
                Err(TryLockError::Poisoned(poisoned)) => {
                    self.deliver_close_notify(&mut poisoned.into_inner(), &close_notify)
                }
                Err(TryLockError::WouldBlock) => {
                    debug!("writer in progress, dropping close_notify");
                }
            }
        }

        shutdown_stream(&self.stream)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsTransport")
            .field("stream", &self.stream)
            .field("established", &self.is_established())
            .finish_non_exhaustive()
    }
}
