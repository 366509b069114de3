mod common;

use std::{
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

use mpc_io::{ErrorKind, MsgId, State, TlsContext};
use mpcnet_fixture_certs::{
    CA_CERT_PEM, PARTY_CERT_PEM, PARTY_DOMAIN, PARTY_KEY_ENCRYPTED_PEM, PARTY_KEY_PASSWORD,
    ROGUE_CA_CERT_PEM,
};
use rstest::rstest;

use common::*;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[rstest]
fn test_round_trip(
    #[values(Mode::Plain, Mode::Tls)] mode: Mode,
    #[values(0, 1, 4096, 1 << 20)] len: usize,
) {
    init_tracing();
    let (server, client) = pair(mode);
    let data = pattern(len, 7);

    thread::scope(|s| {
        let sender = s.spawn(|| client.send(&data, TIMEOUT));

        let mut received = vec![0u8; len];
        assert_eq!(server.recv(&mut received, TIMEOUT).unwrap(), len);
        assert_eq!(sender.join().unwrap().unwrap(), len);
        assert_eq!(received, data);
    });

    // The other direction, tagged.
    let id = MsgId::new("reply");
    thread::scope(|s| {
        let sender = s.spawn(|| server.send_tagged(&id, &data, TIMEOUT));

        let mut received = vec![0u8; len];
        assert_eq!(client.recv_tagged(&id, &mut received, TIMEOUT).unwrap(), len);
        assert_eq!(sender.join().unwrap().unwrap(), len);
        assert_eq!(received, data);
    });
}

#[rstest]
#[case::plain(Mode::Plain)]
#[case::tls(Mode::Tls)]
fn test_timeout_keeps_connection_usable(#[case] mode: Mode) {
    init_tracing();
    let (server, client) = pair(mode);

    let start = Instant::now();
    let mut buf = [0u8; 4];
    let err = server
        .recv(&mut buf, Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(server.state(), State::Connected);

    client.send(b"late", TIMEOUT).unwrap();
    server.recv(&mut buf, TIMEOUT).unwrap();
    assert_eq!(&buf, b"late");
}

/// Order in which the writer emits the two identifiers within a round.
#[derive(Debug, Clone, Copy)]
enum WriteOrder {
    Alternating,
    Reversed,
    Scrambled,
}

impl WriteOrder {
    fn round(self, round: usize) -> [usize; 2] {
        let flip = match self {
            WriteOrder::Alternating => false,
            WriteOrder::Reversed => true,
            WriteOrder::Scrambled => (round.wrapping_mul(0x9e37_79b9) >> 11) & 1 == 1,
        };
        if flip {
            [1, 0]
        } else {
            [0, 1]
        }
    }
}

#[rstest]
fn test_concurrent_tagged_receivers(
    #[values(Mode::Plain, Mode::Tls)] mode: Mode,
    #[values(WriteOrder::Alternating, WriteOrder::Reversed, WriteOrder::Scrambled)]
    order: WriteOrder,
) {
    init_tracing();
    let (server, client) = pair(mode);

    const ROUNDS: usize = 100;
    const CHUNK: usize = 64;
    let ids = [MsgId::new("mul/open"), MsgId::new("psi/oprf")];

    thread::scope(|s| {
        let receivers: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(seed, id)| {
                let server = &server;
                s.spawn(move || {
                    for round in 0..ROUNDS {
                        let mut buf = [0u8; CHUNK];
                        server.recv_tagged(id, &mut buf, TIMEOUT).unwrap();
                        assert_eq!(buf.to_vec(), pattern(CHUNK, (seed * ROUNDS + round) as u8));
                    }
                })
            })
            .collect();

        let writer = s.spawn(|| {
            for round in 0..ROUNDS {
                for seed in order.round(round) {
                    let chunk = pattern(CHUNK, (seed * ROUNDS + round) as u8);
                    client.send_tagged(&ids[seed], &chunk, TIMEOUT).unwrap();
                }
            }
        });

        writer.join().unwrap();
        for receiver in receivers {
            receiver.join().unwrap();
        }
    });

    assert_eq!(server.state(), State::Connected);
}

#[rstest]
#[case::plain(Mode::Plain)]
#[case::tls(Mode::Tls)]
fn test_close_releases_stalled_sender(#[case] mode: Mode) {
    init_tracing();
    // The server never reads, so the sender stalls once the socket buffers fill up.
    let (_server, client) = pair(mode);
    let client = Arc::new(client);

    let sender = {
        let client = client.clone();
        thread::spawn(move || client.send(&vec![0u8; 32 << 20], None))
    };
    thread::sleep(Duration::from_millis(500));
    assert!(!sender.is_finished());

    let (done_tx, done_rx) = mpsc::channel();
    let closer = {
        let client = client.clone();
        thread::spawn(move || {
            client.close();
            let _ = done_tx.send(());
        })
    };

    assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    closer.join().unwrap();
    assert!(sender.join().unwrap().is_err());
    assert_eq!(client.state(), State::Closed);
}

#[rstest]
#[case::plain(Mode::Plain)]
#[case::tls(Mode::Tls)]
fn test_concurrent_senders(#[case] mode: Mode) {
    init_tracing();
    let (server, client) = pair(mode);

    const SENDERS: usize = 4;
    const ROUNDS: usize = 50;

    thread::scope(|s| {
        for sender in 0..SENDERS {
            let client = &client;
            s.spawn(move || {
                let id = MsgId::new(format!("sender-{sender}"));
                for round in 0..ROUNDS {
                    let chunk = pattern(32, (sender * ROUNDS + round) as u8);
                    client.send_tagged(&id, &chunk, TIMEOUT).unwrap();
                }
            });
        }

        for sender in 0..SENDERS {
            let id = MsgId::new(format!("sender-{sender}"));
            for round in 0..ROUNDS {
                let mut buf = [0u8; 32];
                server.recv_tagged(&id, &mut buf, TIMEOUT).unwrap();
                assert_eq!(buf.to_vec(), pattern(32, (sender * ROUNDS + round) as u8));
            }
        }
    });

    assert_eq!(client.sends_in_flight(), 0);
}

#[rstest]
#[case::plain(Mode::Plain)]
#[case::tls(Mode::Tls)]
fn test_tagged_and_untagged_channels_are_independent(#[case] mode: Mode) {
    init_tracing();
    let (server, client) = pair(mode);
    let id = MsgId::new("ot/extend");

    client.send_tagged(&id, b"tagged", TIMEOUT).unwrap();
    client.send(b"plain", TIMEOUT).unwrap();

    let mut buf = [0u8; 5];
    server.recv(&mut buf, TIMEOUT).unwrap();
    assert_eq!(&buf, b"plain");

    let mut buf = [0u8; 6];
    server.recv_tagged(&id, &mut buf, TIMEOUT).unwrap();
    assert_eq!(&buf, b"tagged");

    let err = server
        .recv(&mut [0u8; 1], Some(Duration::from_millis(20)))
        .unwrap_err();
    assert!(err.is_timeout());
}

#[rstest]
#[case::plain(Mode::Plain)]
#[case::tls(Mode::Tls)]
fn test_peek_does_not_consume(#[case] mode: Mode) {
    init_tracing();
    let (server, client) = pair(mode);

    client.send(b"look ahead", TIMEOUT).unwrap();

    let mut peeked = [0u8; 4];
    assert_eq!(server.peek(&mut peeked, TIMEOUT).unwrap(), 4);
    assert_eq!(&peeked, b"look");

    let mut buf = [0u8; 10];
    server.recv(&mut buf, TIMEOUT).unwrap();
    assert_eq!(&buf, b"look ahead");
}

#[rstest]
#[case::plain(Mode::Plain)]
#[case::tls(Mode::Tls)]
fn test_close_twice(#[case] mode: Mode) {
    init_tracing();
    let (server, client) = pair(mode);

    client.close();
    client.close();
    assert_eq!(client.state(), State::Closed);

    let err = client.send(b"after close", TIMEOUT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
    let err = client.recv(&mut [0u8; 1], TIMEOUT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);

    server.close();
    assert_eq!(server.state(), State::Closed);
}

#[rstest]
#[case::plain(Mode::Plain)]
#[case::tls(Mode::Tls)]
fn test_misuse_before_handshake(#[case] mode: Mode) {
    init_tracing();
    let (server, client) = raw_pair(mode);

    let err = client.send(b"early", TIMEOUT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
    let err = server.recv(&mut [0u8; 1], TIMEOUT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
    assert_eq!(server.state(), State::Invalid);
    assert_eq!(client.state(), State::Invalid);

    let (server_result, client_result) = handshake_both(&server, &client);
    server_result.unwrap();
    client_result.unwrap();
    assert_eq!(server.state(), State::Connected);
    assert_eq!(client.state(), State::Connected);

    // Repeated handshakes are no-ops.
    client.handshake(TIMEOUT).unwrap();
}

#[rstest]
#[case::plain(Mode::Plain)]
#[case::tls(Mode::Tls)]
fn test_peer_close_fails_connection(#[case] mode: Mode) {
    init_tracing();
    let (server, client) = pair(mode);

    client.send(b"bye", TIMEOUT).unwrap();
    client.close();

    let mut buf = [0u8; 3];
    server.recv(&mut buf, TIMEOUT).unwrap();
    assert_eq!(&buf, b"bye");

    let err = server.recv(&mut buf, TIMEOUT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PeerClosed);
    assert!(err.is_fatal());
    assert_eq!(server.state(), State::Failed);

    server.close();
    assert_eq!(server.state(), State::Failed);
}

#[test]
fn test_tls_untrusted_certificate_fails_both_sides() {
    init_tracing();
    let rogue = Arc::new(
        TlsContext::builder()
            .root_ca_pem(ROGUE_CA_CERT_PEM)
            .server_name(PARTY_DOMAIN)
            .build()
            .unwrap(),
    );
    let (server, client) = tls_pair(party_context(), rogue);

    let (server_result, client_result) = handshake_both(&server, &client);
    assert_eq!(client_result.unwrap_err().kind(), ErrorKind::Tls);
    assert!(server_result.is_err());
    assert_eq!(client.state(), State::Failed);
    assert_eq!(server.state(), State::Failed);
    assert!(!client.transport().is_established());

    // No application data passes afterwards.
    let err = client.send(b"secret", TIMEOUT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
    let err = server.recv(&mut [0u8; 1], TIMEOUT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
}

#[test]
fn test_tls_wrong_server_name_fails() {
    init_tracing();
    let elsewhere = Arc::new(
        TlsContext::builder()
            .root_ca_pem(CA_CERT_PEM)
            .server_name("elsewhere.mpc.test")
            .build()
            .unwrap(),
    );
    let (server, client) = tls_pair(party_context(), elsewhere);

    let (server_result, client_result) = handshake_both(&server, &client);
    assert_eq!(client_result.unwrap_err().kind(), ErrorKind::Tls);
    assert!(server_result.is_err());
    assert_eq!(client.state(), State::Failed);
}

#[test]
fn test_tls_encrypted_key() {
    init_tracing();
    let server_context = Arc::new(
        TlsContext::builder()
            .identity_pem(PARTY_CERT_PEM, PARTY_KEY_ENCRYPTED_PEM)
            .key_password(PARTY_KEY_PASSWORD)
            .build()
            .unwrap(),
    );
    let (server, client) = tls_pair(server_context, party_context());

    let (server_result, client_result) = handshake_both(&server, &client);
    server_result.unwrap();
    client_result.unwrap();

    client.send(b"encrypted", TIMEOUT).unwrap();
    let mut buf = [0u8; 9];
    server.recv(&mut buf, TIMEOUT).unwrap();
    assert_eq!(&buf, b"encrypted");
}

#[test]
fn test_tls_session_lifetime() {
    init_tracing();
    let context = party_context();
    let (server, client) = tls_pair(context.clone(), context);
    assert!(!client.transport().is_established());

    let (server_result, client_result) = handshake_both(&server, &client);
    server_result.unwrap();
    client_result.unwrap();

    assert!(client.transport().is_established());
    let certs = client.transport().peer_certificates().unwrap();
    assert_eq!(certs.len(), 1);
    assert!(server.transport().peer_certificates().is_none());

    client.close();
    assert!(!client.transport().is_established());
    assert_eq!(client.state(), State::Closed);
}

#[test]
fn test_server_context_cannot_connect() {
    init_tracing();
    let server_only = Arc::new(
        TlsContext::builder()
            .identity_pem(PARTY_CERT_PEM, mpcnet_fixture_certs::PARTY_KEY_PEM)
            .build()
            .unwrap(),
    );
    let (_server, client) = tls_pair(party_context(), server_only);

    let err = client.handshake(TIMEOUT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Tls);
    assert_eq!(client.state(), State::Failed);
}
