use std::{error::Error, io};

use crate::state::StateError;

/// Transport error.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct IoError(#[from] pub(crate) ErrorRepr);

/// The kind of an [`IoError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller supplied deadline passed before the operation completed.
    Timeout,
    /// The peer closed the connection.
    PeerClosed,
    /// An unrecoverable socket error, e.g. a reset or a broken pipe.
    Io,
    /// The TLS handshake or a TLS record was rejected.
    Tls,
    /// The peer sent a malformed frame or a frame exceeded the size limit.
    Frame,
    /// The operation is not allowed in the current state of the connection.
    Misuse,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ErrorRepr {
    #[error("operation timed out")]
    Timeout,
    #[error("connection closed by peer")]
    PeerClosed,
    #[error("io error: {0}")]
    Io(io::Error),
    #[error("tls error: {0}")]
    Tls(Box<dyn Error + Send + Sync + 'static>),
    #[error("frame error: {0}")]
    Frame(String),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("invalid message id: {0}")]
    MsgId(String),
    #[error("invalid use: {0}")]
    Misuse(String),
}

impl IoError {
    pub(crate) fn timeout() -> Self {
        Self(ErrorRepr::Timeout)
    }

    pub(crate) fn peer_closed() -> Self {
        Self(ErrorRepr::PeerClosed)
    }

    pub(crate) fn tls<E>(err: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync + 'static>>,
    {
        Self(ErrorRepr::Tls(err.into()))
    }

    pub(crate) fn frame(msg: impl Into<String>) -> Self {
        Self(ErrorRepr::Frame(msg.into()))
    }

    pub(crate) fn msg_id(msg: impl Into<String>) -> Self {
        Self(ErrorRepr::MsgId(msg.into()))
    }

    pub(crate) fn misuse(msg: impl Into<String>) -> Self {
        Self(ErrorRepr::Misuse(msg.into()))
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match &self.0 {
            ErrorRepr::Timeout => ErrorKind::Timeout,
            ErrorRepr::PeerClosed => ErrorKind::PeerClosed,
            ErrorRepr::Io(_) => ErrorKind::Io,
            ErrorRepr::Tls(_) => ErrorKind::Tls,
            ErrorRepr::Frame(_) => ErrorKind::Frame,
            ErrorRepr::State(_) | ErrorRepr::MsgId(_) | ErrorRepr::Misuse(_) => ErrorKind::Misuse,
        }
    }

    /// Returns `true` if the operation timed out.
    ///
    /// A timed out operation leaves the connection usable, so the caller may
    /// retry with a longer timeout.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Returns `true` if the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PeerClosed | ErrorKind::Io | ErrorKind::Tls | ErrorKind::Frame
        )
    }
}

impl From<StateError> for IoError {
    fn from(err: StateError) -> Self {
        Self(ErrorRepr::State(err))
    }
}

impl From<rustls::Error> for IoError {
    fn from(err: rustls::Error) -> Self {
        Self::tls(err)
    }
}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        if err
            .get_ref()
            .map(|inner| inner.is::<rustls::Error>())
            .unwrap_or(false)
        {
            return Self::tls(err);
        }

        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::timeout(),
            io::ErrorKind::UnexpectedEof => Self::peer_closed(),
            _ => Self(ErrorRepr::Io(err)),
        }
    }
}
