//! Connection tunables and the network description of a computation.
use std::{
    error::Error,
    fmt, fs,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::TlsContext;

const DEFAULT_MAX_FRAME_LENGTH: usize = 64 << 20;
const DEFAULT_READ_CHUNK_SIZE: usize = 16 << 10;
const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(10);

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_SERVER_CERT: &str = "certs/server-nopass.cert";
const DEFAULT_SERVER_PRIKEY: &str = "certs/server-prikey";

/// Tunables of a [`Connection`](crate::Connection).
#[derive(derive_builder::Builder, Clone, Debug)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct ConnectionConfig {
    /// Largest payload accepted in a single frame, in either direction.
    #[builder(default = "DEFAULT_MAX_FRAME_LENGTH")]
    max_frame_length: usize,
    /// Largest amount of bytes pulled off the socket at once.
    #[builder(default = "DEFAULT_READ_CHUNK_SIZE")]
    read_chunk_size: usize,
    /// How long a receiver which is not pulling from the socket sleeps before
    /// checking whether it can take over.
    #[builder(default = "DEFAULT_WAIT_INTERVAL")]
    wait_interval: Duration,
}

impl ConnectionConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.max_frame_length == Some(0) {
            return Err("max_frame_length must be positive".to_string());
        }
        if self.max_frame_length.unwrap_or(0) > u32::MAX as usize {
            return Err("max_frame_length must fit into the 32 bit length prefix".to_string());
        }
        if self.read_chunk_size == Some(0) {
            return Err("read_chunk_size must be positive".to_string());
        }
        if self.wait_interval.is_some_and(|interval| interval.is_zero()) {
            return Err("wait_interval must be positive".to_string());
        }
        Ok(())
    }
}

impl ConnectionConfig {
    /// Creates a new builder for `ConnectionConfig`.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Returns the largest payload accepted in a single frame.
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Returns the largest amount of bytes pulled off the socket at once.
    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size
    }

    /// Returns the polling interval of receivers waiting for the socket.
    pub fn wait_interval(&self) -> Duration {
        self.wait_interval
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            wait_interval: DEFAULT_WAIT_INTERVAL,
        }
    }
}

/// Addresses, TLS material and default timeouts of all parties.
///
/// Usually loaded from a JSON file with [`NetworkConfig::load`]:
///
/// ```json
/// {
///   "party_id": 0,
///   "parties": [
///     { "port": 32000 },
///     { "host": "10.0.0.2", "port": 32001 }
///   ],
///   "tls": { "ca_cert": "certs/ca.pem", "server_name": "party.mpc.test" },
///   "recv_timeout_ms": 30000
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Index of the local party in `parties`.
    pub party_id: usize,
    /// All parties of the computation, the local one included.
    pub parties: Vec<PartyConfig>,
    /// TLS material, plain TCP is used when absent.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Default send timeout in milliseconds, negative means indefinite.
    #[serde(default = "indefinite")]
    pub send_timeout_ms: i64,
    /// Default receive timeout in milliseconds, negative means indefinite.
    #[serde(default = "indefinite")]
    pub recv_timeout_ms: i64,
}

/// Address of a single party.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartyConfig {
    /// Display name, defaults to `P{index}`.
    #[serde(default)]
    pub name: Option<String>,
    /// Host name or address, defaults to `127.0.0.1`.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listening port.
    pub port: u16,
}

/// Paths to the TLS material of the local party.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Certificate chain presented when accepting connections.
    #[serde(default = "default_server_cert")]
    pub server_cert: PathBuf,
    /// Private key belonging to `server_cert`.
    #[serde(default = "default_server_prikey")]
    pub server_prikey: PathBuf,
    /// Passphrase of an encrypted `server_prikey`, empty if not encrypted.
    #[serde(default)]
    pub server_prikey_password: String,
    /// Certificate authority used to verify the other parties. Accepted
    /// connections only are possible without it.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    /// Name the certificates of the other parties are verified against.
    #[serde(default)]
    pub server_name: Option<String>,
}

fn indefinite() -> i64 {
    -1
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_server_cert() -> PathBuf {
    PathBuf::from(DEFAULT_SERVER_CERT)
}

fn default_server_prikey() -> PathBuf {
    PathBuf::from(DEFAULT_SERVER_PRIKEY)
}

fn timeout_from_ms(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().map(Duration::from_millis)
}

impl NetworkConfig {
    /// Parses a configuration from a JSON string.
    ///
    /// Relative paths are kept as they are.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a JSON file.
    ///
    /// Relative TLS paths are resolved against the directory of the file, so
    /// a party can be started from anywhere.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(ConfigError::io)?;
        let mut config = Self::from_json(&json)?;

        if let (Some(tls), Some(base)) = (config.tls.as_mut(), path.parent()) {
            tls.resolve_paths(base);
        }

        debug!(path = %path.display(), parties = config.parties.len(), "loaded network config");

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.party_id >= self.parties.len() {
            return Err(ConfigError::parse(format!(
                "party_id {} is out of range for {} parties",
                self.party_id,
                self.parties.len()
            )));
        }
        Ok(())
    }

    /// Returns the local party.
    pub fn local(&self) -> Option<&PartyConfig> {
        self.party(self.party_id)
    }

    /// Returns the party with the given index.
    pub fn party(&self, index: usize) -> Option<&PartyConfig> {
        self.parties.get(index)
    }

    /// Returns the display name of the party with the given index.
    pub fn party_name(&self, index: usize) -> Option<String> {
        self.party(index).map(|party| {
            party
                .name
                .clone()
                .unwrap_or_else(|| format!("P{index}"))
        })
    }

    /// Returns the default send timeout, `None` meaning indefinite.
    pub fn send_timeout(&self) -> Option<Duration> {
        timeout_from_ms(self.send_timeout_ms)
    }

    /// Returns the default receive timeout, `None` meaning indefinite.
    pub fn recv_timeout(&self) -> Option<Duration> {
        timeout_from_ms(self.recv_timeout_ms)
    }
}

impl PartyConfig {
    /// Resolves the address of the party.
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(ConfigError::io)?
            .next()
            .ok_or_else(|| ConfigError::parse(format!("{} does not resolve", self.host)))
    }
}

impl TlsConfig {
    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        resolve(&mut self.server_cert);
        resolve(&mut self.server_prikey);
        if let Some(ca_cert) = self.ca_cert.as_mut() {
            resolve(ca_cert);
        }
    }

    /// Reads the configured files and builds a [`TlsContext`].
    pub fn load_context(&self) -> Result<TlsContext, ConfigError> {
        let cert = read_pem(&self.server_cert)?;
        let key = read_pem(&self.server_prikey)?;

        let mut builder = TlsContext::builder()
            .identity_pem(cert, key)
            .key_password(self.server_prikey_password.clone());
        if let Some(ca_cert) = &self.ca_cert {
            builder = builder.root_ca_pem(read_pem(ca_cert)?);
        }
        if let Some(server_name) = &self.server_name {
            builder = builder.server_name(server_name.clone());
        }

        builder.build()
    }
}

fn read_pem(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|err| {
        ConfigError::new(
            ErrorKind::Io,
            format!("failed to read {}: {err}", path.display()),
        )
    })
}

/// A configuration error.
#[derive(thiserror::Error, Debug)]
pub struct ConfigError {
    kind: ErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl ConfigError {
    fn new<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            kind,
            source: Some(source.into()),
        }
    }

    pub(crate) fn io<E>(source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Io, source)
    }

    pub(crate) fn parse<E>(source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Parse, source)
    }

    pub(crate) fn tls<E>(source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Tls, source)
    }

    pub(crate) fn certificate<E>(source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Certificate, source)
    }

    pub(crate) fn key<E>(source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Key, source)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Io => write!(f, "io error")?,
            ErrorKind::Parse => write!(f, "parse error")?,
            ErrorKind::Tls => write!(f, "tls config error")?,
            ErrorKind::Certificate => write!(f, "certificate error")?,
            ErrorKind::Key => write!(f, "private key error")?,
        }

        if let Some(ref source) = self.source {
            write!(f, " caused by: {}", source)?;
        }

        Ok(())
    }
}

#[derive(Debug)]
enum ErrorKind {
    Io,
    Parse,
    Tls,
    Certificate,
    Key,
}
