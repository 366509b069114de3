//! Point-to-point transport between the parties of a multi-party computation.
//!
//! A [`Connection`] owns one connected TCP socket and moves byte-exact,
//! ordered messages to the peer. Messages are either untagged, in which case
//! they flow through a default channel, or addressed to a [`MsgId`], in which
//! case several threads can each block on their own identifier while sharing
//! the socket.
//!
//! Byte transfer is delegated to a [`Transport`]. [`PlainTransport`] talks to
//! the socket directly while [`TlsTransport`] routes everything through a TLS
//! session established by [`Connection::handshake`].
//!
//! ```no_run
//! use std::{net::TcpStream, time::Duration};
//!
//! use mpc_io::{Connection, MsgId, Role};
//!
//! # fn main() -> Result<(), mpc_io::IoError> {
//! let stream = TcpStream::connect("127.0.0.1:9999")?;
//! let conn = Connection::new(stream, Role::Client)?;
//! conn.handshake(Some(Duration::from_secs(5)))?;
//!
//! let id = MsgId::new("mul/open");
//! conn.send_tagged(&id, b"share", None)?;
//!
//! let mut reply = [0u8; 5];
//! conn.recv_tagged(&id, &mut reply, Some(Duration::from_secs(5)))?;
//! conn.close();
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs, unreachable_pub, unused_must_use)]
#![deny(clippy::all)]
#![forbid(unsafe_code)]

pub mod backend;
mod buffer;
pub mod codec;
pub mod config;
mod connection;
mod context;
mod error;
mod msg_id;
pub mod socket;
mod state;
pub mod transport;

pub use backend::BackendHandles;
pub use buffer::CycleBuffer;
pub use connection::{Connection, ConnectionId, TlsConnection};
pub use context::{TlsContext, TlsContextBuilder};
pub use error::{ErrorKind, IoError};
pub use msg_id::MsgId;
pub use state::{State, StateError};
pub use transport::{PlainTransport, TlsTransport, Transport};

use serde::{Deserialize, Serialize};

/// The side of the TCP connection a party is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The party accepted the connection.
    Server,
    /// The party initiated the connection.
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}
