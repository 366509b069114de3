//! Certificate fixtures for testing TLS connections between parties.

#![deny(missing_docs, unreachable_pub, unused_must_use)]
#![deny(clippy::all)]
#![forbid(unsafe_code)]

/// A certificate authority certificate fixture.
pub static CA_CERT_PEM: &str = include_str!("root_ca_cert.pem");
/// A self-signed certificate authority which did not issue any fixture.
pub static ROGUE_CA_CERT_PEM: &str = include_str!("rogue_ca_cert.pem");
/// A party certificate (domain=party.mpc.test) signed by [`CA_CERT_PEM`].
pub static PARTY_CERT_PEM: &str = include_str!("party_cert.pem");
/// The unencrypted PKCS#8 private key of [`PARTY_CERT_PEM`].
pub static PARTY_KEY_PEM: &str = include_str!("party_key.pem");
/// The same private key, PKCS#8 encrypted with [`PARTY_KEY_PASSWORD`].
pub static PARTY_KEY_ENCRYPTED_PEM: &str = include_str!("party_key_encrypted.pem");
/// Passphrase of [`PARTY_KEY_ENCRYPTED_PEM`].
pub static PARTY_KEY_PASSWORD: &str = "mpc-io-test";
/// The domain name bound to the party certificate.
pub static PARTY_DOMAIN: &str = "party.mpc.test";
