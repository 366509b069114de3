//! Byte-exact transfer primitives.
//!
//! These loop over the [`Transport`] hooks until the requested amount of bytes
//! moved. `Interrupted` is always retried, `WouldBlock` and `TimedOut` are
//! retried until the deadline passes, every other error is returned at once.
//! Before each hook call the transport timeout is set to the time left, so a
//! hook never blocks past the deadline.

use std::{
    io, thread,
    time::{Duration, Instant},
};

use crate::{error::IoError, transport::Transport};

/// Converts a relative timeout into a deadline, `None` meaning no deadline.
pub fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

/// Returns the time left until `deadline`, or a timeout error if it passed.
pub(crate) fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>, IoError> {
    let Some(deadline) = deadline else {
        return Ok(None);
    };

    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(IoError::timeout());
    }

    Ok(Some(left))
}

pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn backoff(err: &io::Error) {
    if err.kind() != io::ErrorKind::Interrupted {
        thread::yield_now();
    }
}

/// Copies readable bytes into `buf` without consuming them.
///
/// Blocks until at least one byte is available and returns how many bytes
/// were copied. End of stream is reported as a peer closed error.
pub fn peek<T: Transport + ?Sized>(
    transport: &T,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> Result<usize, IoError> {
    if buf.is_empty() {
        return Ok(0);
    }

    loop {
        transport.set_read_timeout(remaining(deadline)?)?;
        match transport.peek_impl(buf) {
            Ok(0) => return Err(IoError::peer_closed()),
            Ok(n) => return Ok(n),
            Err(err) if is_transient(&err) => backoff(&err),
            Err(err) => return Err(err.into()),
        }
    }
}

/// Reads exactly `buf.len()` bytes.
pub fn readn<T: Transport + ?Sized>(
    transport: &T,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> Result<usize, IoError> {
    let mut filled = 0;
    while filled < buf.len() {
        transport.set_read_timeout(remaining(deadline)?)?;
        match transport.read_impl(&mut buf[filled..]) {
            Ok(0) => return Err(IoError::peer_closed()),
            Ok(n) => filled += n,
            Err(err) if is_transient(&err) => backoff(&err),
            Err(err) => return Err(err.into()),
        }
    }

    Ok(filled)
}

/// Writes all of `buf`.
pub fn writen<T: Transport + ?Sized>(
    transport: &T,
    buf: &[u8],
    deadline: Option<Instant>,
) -> Result<usize, IoError> {
    let mut written = 0;
    write_tracked(transport, buf, deadline, &mut written)?;
    Ok(written)
}

/// Like [`writen`], recording progress in `written` so callers can tell a
/// clean failure from one which left a partial write behind.
pub(crate) fn write_tracked<T: Transport + ?Sized>(
    transport: &T,
    buf: &[u8],
    deadline: Option<Instant>,
    written: &mut usize,
) -> Result<(), IoError> {
    while *written < buf.len() {
        transport.set_write_timeout(remaining(deadline)?)?;
        match transport.write_impl(&buf[*written..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => *written += n,
            Err(err) if is_transient(&err) => backoff(&err),
            Err(err) => return Err(err.into()),
        }
    }

    loop {
        transport.set_write_timeout(remaining(deadline)?)?;
        match transport.flush_impl() {
            Ok(()) => return Ok(()),
            Err(err) if is_transient(&err) => backoff(&err),
            Err(err) => return Err(err.into()),
        }
    }
}
