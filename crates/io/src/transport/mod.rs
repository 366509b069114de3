//! Byte transfer hooks used by [`Connection`](crate::Connection).
//!
//! All timeout, retry and buffering logic is written once against the
//! [`Transport`] trait. The hooks themselves move as many bytes as the
//! underlying channel accepts in a single call and report transient
//! conditions (`WouldBlock`, `TimedOut`, `Interrupted`) as plain
//! [`std::io::Error`]s, see [`socket`](crate::socket) for the retrying
//! wrappers.

mod plain;
mod tls;

pub use plain::PlainTransport;
pub use tls::TlsTransport;

use std::{
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::{error::IoError, Role};

/// Capability to move bytes to and from a peer.
pub trait Transport: Send + Sync {
    /// Reads at most `buf.len()` bytes, returning `0` at end of stream.
    fn read_impl(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes at most `buf.len()` bytes.
    fn write_impl(&self, buf: &[u8]) -> io::Result<usize>;

    /// Copies at most `buf.len()` readable bytes into `buf` without consuming
    /// them, blocking until at least one byte is available.
    ///
    /// Returns `0` at end of stream.
    fn peek_impl(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Pushes out bytes accepted by [`write_impl`](Self::write_impl) which are
    /// still held back by the transport.
    fn flush_impl(&self) -> io::Result<()> {
        Ok(())
    }

    /// Bounds how long a single read hook may block, `None` blocks
    /// indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Bounds how long a single write hook may block, `None` blocks
    /// indefinitely.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Establishes the session for the given role.
    fn handshake(&self, role: Role, deadline: Option<Instant>) -> Result<(), IoError> {
        let _ = (role, deadline);
        Ok(())
    }

    /// Tears down the session and shuts the underlying socket down.
    ///
    /// Calling this more than once is harmless.
    fn shutdown(&self) -> io::Result<()>;

    /// Returns the address of the peer.
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_impl(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_impl(buf)
    }

    fn write_impl(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).write_impl(buf)
    }

    fn peek_impl(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).peek_impl(buf)
    }

    fn flush_impl(&self) -> io::Result<()> {
        (**self).flush_impl()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_write_timeout(timeout)
    }

    fn handshake(&self, role: Role, deadline: Option<Instant>) -> Result<(), IoError> {
        (**self).handshake(role, deadline)
    }

    fn shutdown(&self) -> io::Result<()> {
        (**self).shutdown()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        (**self).peer_addr()
    }
}
