//! Identifier types used throughout the worldsync core.
//!
//! Session and entity identifiers are RFC-4122 UUIDs. Client identifiers are
//! free-form strings chosen by the client (or generated for anonymous
//! members) and must be safe to embed in a pub/sub topic.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum length of a client identifier, in bytes.
pub const MAX_CLIENT_ID_LEN: usize = 128;

/// Unique identifier for a session.
/// Chosen by the session creator and immutable once the session exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new random session ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a session ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses a session ID from its textual form.
    pub fn parse(s: &str) -> Result<Self, Error> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Unique identifier for a scene entity.
/// Matches the identifier the entity model uses for the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Creates a new random entity ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an entity ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses an entity ID from its textual form.
    pub fn parse(s: &str) -> Result<Self, Error> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for EntityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identifier of a client (session member).
///
/// Authenticated clients bring their own ID; anonymous clients get an
/// ephemeral one for the lifetime of their connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    /// Validates and wraps a client-supplied identifier.
    ///
    /// Rejects empty IDs, IDs longer than [`MAX_CLIENT_ID_LEN`], and IDs
    /// containing whitespace or topic separators/wildcards (`/`, `+`, `#`) or NUL.
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidClientId("client id is empty".into()));
        }
        if id.len() > MAX_CLIENT_ID_LEN {
            return Err(Error::InvalidClientId(format!(
                "client id exceeds {MAX_CLIENT_ID_LEN} bytes"
            )));
        }
        if id
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '+' | '#' | '\0'))
        {
            return Err(Error::InvalidClientId(format!(
                "client id {id:?} contains reserved characters"
            )));
        }
        Ok(Self(id))
    }

    /// Generates an ephemeral identifier for an anonymous client.
    #[must_use]
    pub fn anonymous() -> Self {
        Self(format!("anon-{}", Uuid::new_v4().simple()))
    }

    /// Whether this ID was generated by [`ClientId::anonymous`].
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with("anon-")
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClientId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ClientId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
