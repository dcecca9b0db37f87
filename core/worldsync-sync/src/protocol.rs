//! Session protocol messages.
//!
//! Every payload on a session topic is a JSON-encoded [`Envelope`]:
//! the protocol version, the sending client, and one [`SessionMessage`].
//!
//! The protocol is fire-and-forget. Creation is optimistic, announcements
//! are not acknowledged, and the only request/response pair is the state
//! snapshot a joiner asks for.

use crate::entity_model::AssetManifest;
use crate::error::{SyncError, SyncResult};
use crate::registry::SynchronizedEntity;
use crate::session::Member;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use worldsync_types::{ClientId, EntityId, SessionId, Transform, Vector3};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// A protocol message with its sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub sender: ClientId,
    pub message: SessionMessage,
}

impl Envelope {
    pub fn new(sender: ClientId, message: SessionMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sender,
            message,
        }
    }

    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a payload, rejecting other protocol versions.
    pub fn decode(payload: &[u8]) -> SyncResult<Self> {
        let envelope: Self = serde_json::from_slice(payload)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(SyncError::Protocol(format!(
                "version mismatch: expected {PROTOCOL_VERSION}, got {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

/// A session protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionMessage {
    /// Session metadata published (retained) by the creator.
    SessionInfo(SessionInfoMessage),

    /// The creator tore the session down.
    SessionClosed { session_id: SessionId },

    /// A client announces itself (on join, or when its tag changes).
    Presence(Member),

    /// A client left the session. Also used as the last-will payload.
    ClientLeft { client_id: ClientId, graceful: bool },

    /// A joiner asks any member for the current session state.
    StateRequest(StateRequestMessage),

    /// Current session state, addressed to one requester.
    StateSnapshot(StateSnapshotMessage),

    /// An entity started being synchronized (or was re-announced).
    EntityAnnounce(EntityAnnouncement),

    /// New transform for a synchronized entity.
    EntityUpdate {
        entity_id: EntityId,
        transform: Transform,
    },

    /// An entity stopped being synchronized.
    EntityRemove { entity_id: EntityId },

    /// Application message.
    App { topic: String, payload: String },
}

impl SessionMessage {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionInfo(_) => "session_info",
            Self::SessionClosed { .. } => "session_closed",
            Self::Presence(_) => "presence",
            Self::ClientLeft { .. } => "client_left",
            Self::StateRequest(_) => "state_request",
            Self::StateSnapshot(_) => "state_snapshot",
            Self::EntityAnnounce(_) => "entity_announce",
            Self::EntityUpdate { .. } => "entity_update",
            Self::EntityRemove { .. } => "entity_remove",
            Self::App { .. } => "app",
        }
    }
}

/// Session metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfoMessage {
    pub session_id: SessionId,
    pub tag: String,
    pub creator: ClientId,
    /// Creator's world offset, informational only.
    pub world_offset: Vector3,
}

/// Request for the current session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRequestMessage {
    /// Correlates the snapshot with the request.
    pub request_id: Uuid,
    pub requester: ClientId,
}

impl StateRequestMessage {
    pub fn new(requester: ClientId) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            requester,
        }
    }
}

/// Snapshot of a session as seen by the responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshotMessage {
    pub request_id: Uuid,
    pub session_tag: String,
    /// Members, responder included.
    pub members: Vec<Member>,
    /// Every synchronized entity, in registration order.
    pub entities: Vec<EntityAnnouncement>,
}

/// Everything a peer needs to materialize a synchronized entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAnnouncement {
    pub entity_id: EntityId,
    pub owner: ClientId,
    pub delete_with_client: bool,
    /// Transform in session space.
    pub transform: Transform,
    #[serde(default)]
    pub manifest: Option<AssetManifest>,
}

impl EntityAnnouncement {
    pub fn new(entity: &SynchronizedEntity, transform: Transform) -> Self {
        Self {
            entity_id: entity.entity_id,
            owner: entity.owner.clone(),
            delete_with_client: entity.delete_with_client,
            transform,
            manifest: entity.manifest.clone(),
        }
    }

    /// Registry metadata carried by this announcement.
    pub fn to_entity(&self) -> SynchronizedEntity {
        SynchronizedEntity::new(self.entity_id, self.owner.clone(), self.delete_with_client)
            .with_manifest(self.manifest.clone())
    }
}
