//! Client identity and credentials.

use crate::error::SyncResult;
use serde::{Deserialize, Serialize};
use worldsync_types::ClientId;

/// Identity supplied by the application when creating or joining a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// Client ID for authenticated rejoin. `None` means anonymous.
    pub client_id: Option<String>,
    /// Token presented alongside the client ID during the transport handshake.
    pub client_token: Option<String>,
    /// Human-readable display tag.
    pub tag: String,
}

impl ClientIdentity {
    /// Creates an anonymous identity with the given display tag.
    pub fn anonymous(tag: impl Into<String>) -> Self {
        Self {
            client_id: None,
            client_token: None,
            tag: tag.into(),
        }
    }

    /// Sets the client ID and token used for authenticated rejoin.
    pub fn with_credentials(
        mut self,
        client_id: impl Into<String>,
        client_token: Option<String>,
    ) -> Self {
        self.client_id = Some(client_id.into());
        self.client_token = client_token;
        self
    }

    /// Resolves this identity into the one a synchronizer will use.
    ///
    /// An anonymous identity gets a fresh ephemeral client ID, so each call
    /// yields a different one. Blank IDs count as absent.
    pub fn resolve(&self) -> SyncResult<ResolvedIdentity> {
        let client_id = match self.client_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => ClientId::new(id)?,
            _ => ClientId::anonymous(),
        };
        let anonymous = self
            .client_id
            .as_deref()
            .is_none_or(|id| id.trim().is_empty());
        Ok(ResolvedIdentity {
            client_id,
            client_token: self.client_token.clone().filter(|t| !t.is_empty()),
            tag: self.tag.clone(),
            anonymous,
        })
    }
}

/// The identity a synchronizer presents for the lifetime of its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub client_id: ClientId,
    pub client_token: Option<String>,
    pub tag: String,
    /// Whether the client ID was generated for this connection.
    pub anonymous: bool,
}
