use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

use crate::error::IoError;

/// Identifier of a logical conversation sharing a connection.
///
/// The transport does not interpret identifiers beyond comparing them by
/// value. On the wire an identifier is its UTF-8 encoding, which must be
/// between 1 and [`MsgId::MAX_LEN`] bytes long.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(String);

impl MsgId {
    /// Maximum encoded length of an identifier.
    pub const MAX_LEN: usize = u8::MAX as usize;

    /// Creates a new identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the wire encoding of the identifier.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Checks that the identifier can be put on the wire.
    pub(crate) fn validate(&self) -> Result<(), IoError> {
        if self.0.is_empty() {
            return Err(IoError::msg_id("identifier must not be empty"));
        }

        if self.0.len() > Self::MAX_LEN {
            return Err(IoError::msg_id(format!(
                "identifier is {} bytes long, the limit is {}",
                self.0.len(),
                Self::MAX_LEN
            )));
        }

        Ok(())
    }

    pub(crate) fn from_wire(bytes: &[u8]) -> Result<Self, IoError> {
        std::str::from_utf8(bytes)
            .map(Self::new)
            .map_err(|_| IoError::frame("message id is not valid utf-8"))
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MsgId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MsgId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for MsgId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for MsgId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
