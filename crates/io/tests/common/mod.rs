#![allow(dead_code)]

use std::{
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
    time::Duration,
};

use mpc_io::{
    config::ConnectionConfig, Connection, IoError, PlainTransport, Role, TlsContext,
    TlsTransport, Transport,
};
use mpcnet_fixture_certs::{CA_CERT_PEM, PARTY_CERT_PEM, PARTY_DOMAIN, PARTY_KEY_PEM};
use tracing_subscriber::EnvFilter;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub type DynConnection = Connection<Box<dyn Transport>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Plain,
    Tls,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (server, client)
}

/// A context able to serve and verify the party certificate.
pub fn party_context() -> Arc<TlsContext> {
    Arc::new(
        TlsContext::builder()
            .identity_pem(PARTY_CERT_PEM, PARTY_KEY_PEM)
            .root_ca_pem(CA_CERT_PEM)
            .server_name(PARTY_DOMAIN)
            .build()
            .unwrap(),
    )
}

/// Runs both handshakes at once, as the TLS exchange needs both sides.
pub fn handshake_both<S: Transport, C: Transport>(
    server: &Connection<S>,
    client: &Connection<C>,
) -> (Result<(), IoError>, Result<(), IoError>) {
    thread::scope(|s| {
        let server = s.spawn(|| server.handshake(Some(HANDSHAKE_TIMEOUT)));
        let client = client.handshake(Some(HANDSHAKE_TIMEOUT));
        (server.join().unwrap(), client)
    })
}

/// Creates a connected pair of connections which did not handshake yet.
pub fn raw_pair(mode: Mode) -> (DynConnection, DynConnection) {
    let (server, client) = socket_pair();

    let (server, client): (Box<dyn Transport>, Box<dyn Transport>) = match mode {
        Mode::Plain => (
            Box::new(PlainTransport::new(server).unwrap()),
            Box::new(PlainTransport::new(client).unwrap()),
        ),
        Mode::Tls => {
            let context = party_context();
            (
                Box::new(TlsTransport::new(server, context.clone()).unwrap()),
                Box::new(TlsTransport::new(client, context).unwrap()),
            )
        }
    };

    (
        Connection::from_transport(server, Role::Server, ConnectionConfig::default()).unwrap(),
        Connection::from_transport(client, Role::Client, ConnectionConfig::default()).unwrap(),
    )
}

/// Creates a connected pair of usable connections.
pub fn pair(mode: Mode) -> (DynConnection, DynConnection) {
    let (server, client) = raw_pair(mode);
    let (server_result, client_result) = handshake_both(&server, &client);
    server_result.unwrap();
    client_result.unwrap();
    (server, client)
}

/// Creates a pair of TLS connections using separate contexts per side.
pub fn tls_pair(
    server_context: Arc<TlsContext>,
    client_context: Arc<TlsContext>,
) -> (Connection<TlsTransport>, Connection<TlsTransport>) {
    let (server, client) = socket_pair();
    (
        Connection::new_tls(server, Role::Server, server_context).unwrap(),
        Connection::new_tls(client, Role::Client, client_context).unwrap(),
    )
}
