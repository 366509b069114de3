//! TLS material shared by the connections of a party.

use std::{fmt, sync::Arc};

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::Item;
use tracing::debug;

use crate::config::ConfigError;

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";
const DEFAULT_SERVER_NAME: &str = "localhost";

/// Pre-built TLS configuration used by [`TlsTransport`](crate::TlsTransport)
/// handshakes.
///
/// The server configuration is used on accepted connections, the client
/// configuration on initiated ones. A context which lacks one of them can only
/// be used for the other role.
#[derive(Clone)]
pub struct TlsContext {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
    server_name: ServerName,
}

impl TlsContext {
    /// Creates a new builder for `TlsContext`.
    pub fn builder() -> TlsContextBuilder {
        TlsContextBuilder::default()
    }

    /// Creates a context from existing rustls configurations.
    ///
    /// `server_name` is the name the peer certificate is verified against when
    /// acting as a client.
    pub fn new(
        server: Option<ServerConfig>,
        client: Option<ClientConfig>,
        server_name: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            server: server.map(Arc::new),
            client: client.map(Arc::new),
            server_name: parse_server_name(server_name)?,
        })
    }

    /// Returns the configuration for the server role.
    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.server.clone()
    }

    /// Returns the configuration for the client role.
    pub fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.client.clone()
    }

    /// Returns the name the server certificate is verified against.
    pub fn server_name(&self) -> &ServerName {
        &self.server_name
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// Builder for [`TlsContext`] from PEM encoded material.
#[derive(Default)]
pub struct TlsContextBuilder {
    cert_chain_pem: Option<String>,
    key_pem: Option<String>,
    key_password: Option<String>,
    root_pems: Vec<String>,
    server_name: Option<String>,
}

impl TlsContextBuilder {
    /// Sets the certificate chain and private key presented in the server
    /// role.
    pub fn identity_pem(
        mut self,
        cert_chain_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Self {
        self.cert_chain_pem = Some(cert_chain_pem.into());
        self.key_pem = Some(key_pem.into());
        self
    }

    /// Sets the passphrase of an encrypted PKCS#8 private key.
    ///
    /// An empty passphrase means the key is not encrypted.
    pub fn key_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.key_password = (!password.is_empty()).then_some(password);
        self
    }

    /// Adds certificate authorities trusted in the client role.
    pub fn root_ca_pem(mut self, pem: impl Into<String>) -> Self {
        self.root_pems.push(pem.into());
        self
    }

    /// Sets the name the server certificate is verified against, defaults to
    /// `localhost`.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Builds the context.
    pub fn build(self) -> Result<TlsContext, ConfigError> {
        let server = match (self.cert_chain_pem, self.key_pem) {
            (Some(cert_chain_pem), Some(key_pem)) => {
                let certs = parse_certificates(&cert_chain_pem)?
                    .into_iter()
                    .map(Certificate)
                    .collect();
                let key = match &self.key_password {
                    Some(password) => decrypt_private_key(&key_pem, password)?,
                    None => parse_private_key(&key_pem)?,
                };

                let config = ServerConfig::builder()
                    .with_safe_defaults()
                    .with_no_client_auth()
                    .with_single_cert(certs, key)
                    .map_err(ConfigError::tls)?;
                Some(config)
            }
            _ => None,
        };

        let client = if self.root_pems.is_empty() {
            None
        } else {
            let mut roots = RootCertStore::empty();
            for pem in &self.root_pems {
                let ders = parse_certificates(pem)?;
                let (added, ignored) = roots.add_parsable_certificates(&ders[..]);
                if added == 0 {
                    return Err(ConfigError::certificate("no usable root certificate found"));
                }
                debug!(added, ignored, "loaded root certificates");
            }

            let config = ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Some(config)
        };

        let server_name = self.server_name.as_deref().unwrap_or(DEFAULT_SERVER_NAME);

        TlsContext::new(server, client, server_name)
    }
}

fn parse_server_name(name: &str) -> Result<ServerName, ConfigError> {
    ServerName::try_from(name).map_err(ConfigError::tls)
}

fn parse_certificates(pem: &str) -> Result<Vec<Vec<u8>>, ConfigError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes()).map_err(ConfigError::certificate)?;
    if certs.is_empty() {
        return Err(ConfigError::certificate("no certificate found"));
    }
    Ok(certs)
}

fn parse_private_key(pem: &str) -> Result<PrivateKey, ConfigError> {
    let items = rustls_pemfile::read_all(&mut pem.as_bytes()).map_err(ConfigError::key)?;
    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| ConfigError::key("no private key found"))
}

fn decrypt_private_key(pem: &str, password: &str) -> Result<PrivateKey, ConfigError> {
    let (label, document) = pkcs8::der::Document::from_pem(pem).map_err(ConfigError::key)?;
    if label != ENCRYPTED_KEY_LABEL {
        return Err(ConfigError::key(format!(
            "expected an {ENCRYPTED_KEY_LABEL} block, found {label}"
        )));
    }

    let info = pkcs8::EncryptedPrivateKeyInfo::try_from(document.as_bytes())
        .map_err(ConfigError::key)?;
    let key = info.decrypt(password).map_err(ConfigError::key)?;

    Ok(PrivateKey(key.as_bytes().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpcnet_fixture_certs::{
        CA_CERT_PEM, PARTY_CERT_PEM, PARTY_DOMAIN, PARTY_KEY_ENCRYPTED_PEM, PARTY_KEY_PASSWORD,
        PARTY_KEY_PEM,
    };

    #[test]
    fn test_full_context() {
        let context = TlsContext::builder()
            .identity_pem(PARTY_CERT_PEM, PARTY_KEY_PEM)
            .root_ca_pem(CA_CERT_PEM)
            .server_name(PARTY_DOMAIN)
            .build()
            .unwrap();

        assert!(context.server_config().is_some());
        assert!(context.client_config().is_some());
        assert_eq!(
            context.server_name(),
            &ServerName::try_from(PARTY_DOMAIN).unwrap()
        );
    }

    #[test]
    fn test_client_only_context() {
        let context = TlsContext::builder()
            .root_ca_pem(CA_CERT_PEM)
            .build()
            .unwrap();

        assert!(context.server_config().is_none());
        assert!(context.client_config().is_some());
    }

    #[test]
    fn test_encrypted_key() {
        let plain = parse_private_key(PARTY_KEY_PEM).unwrap();
        let decrypted = decrypt_private_key(PARTY_KEY_ENCRYPTED_PEM, PARTY_KEY_PASSWORD).unwrap();
        assert_eq!(plain, decrypted);

        TlsContext::builder()
            .identity_pem(PARTY_CERT_PEM, PARTY_KEY_ENCRYPTED_PEM)
            .key_password(PARTY_KEY_PASSWORD)
            .build()
            .unwrap();
    }

    #[test]
    fn test_wrong_password_is_rejected() {
        assert!(decrypt_private_key(PARTY_KEY_ENCRYPTED_PEM, "not the password").is_err());
    }

    #[test]
    fn test_encrypted_key_without_password_is_rejected() {
        let result = TlsContext::builder()
            .identity_pem(PARTY_CERT_PEM, PARTY_KEY_ENCRYPTED_PEM)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_material() {
        assert!(parse_certificates("not a certificate").is_err());
        assert!(parse_private_key(PARTY_CERT_PEM).is_err());
        assert!(TlsContext::builder()
            .root_ca_pem(PARTY_KEY_PEM)
            .build()
            .is_err());
        assert!(TlsContext::builder()
            .server_name("not a valid name!")
            .build()
            .is_err());
    }
}
