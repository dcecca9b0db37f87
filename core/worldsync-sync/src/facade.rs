//! Text-typed application surface.
//!
//! [`WorldSync`] is what a scripting bridge binds to. Identifiers cross it as
//! RFC-4122 text and transport kinds as names. Malformed input and failed
//! operations are logged and reported as `false` or `None`; nothing here
//! returns an error or panics.

use crate::entity_model::AssetManifest;
use crate::error::SyncResult;
use crate::events::{JoinedSession, ListenerId};
use crate::identity::ClientIdentity;
use crate::manager::{SessionParams, SynchronizationManager};
use crate::synchronizer::Synchronizer;
use std::fmt::Display;
use std::str::FromStr;
use tracing::{error, warn};
use worldsync_types::{ClientId, Endpoint, EntityId, SessionId, TransportKind, Vector3};

/// Parameters of a create or join call, as the application passes them.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// `"tcp"`, `"websocket"` or `"ws"`.
    pub transport: String,
    pub session_id: String,
    /// Session tag. Only used when creating.
    pub session_tag: String,
    /// Display tag of the local client.
    pub user_tag: String,
    pub world_offset: Vector3,
    pub client_id: Option<String>,
    pub client_token: Option<String>,
}

impl SessionRequest {
    fn to_params(&self) -> SyncResult<SessionParams> {
        let transport = TransportKind::from_str(&self.transport)?;
        let session_id = SessionId::parse(&self.session_id)?;
        let mut identity = ClientIdentity::anonymous(self.user_tag.clone());
        if let Some(client_id) = &self.client_id {
            identity = identity.with_credentials(client_id.clone(), self.client_token.clone());
        }
        Ok(
            SessionParams::new(Endpoint::new(self.host.clone(), self.port), transport, session_id)
                .with_tls(self.tls)
                .with_session_tag(self.session_tag.clone())
                .with_world_offset(self.world_offset)
                .with_identity(identity),
        )
    }
}

fn parse<T>(what: &str, text: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    match text.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            error!("Invalid {} {:?}: {}", what, text, e);
            None
        }
    }
}

/// Application-facing session API.
pub struct WorldSync {
    manager: SynchronizationManager,
}

impl WorldSync {
    pub fn new(manager: SynchronizationManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &SynchronizationManager {
        &self.manager
    }

    // ── Sessions ─────────────────────────────────────────────────

    /// Creates a session. Returns its ID.
    pub async fn create_session(&self, request: &SessionRequest) -> Option<String> {
        let params = match request.to_params() {
            Ok(params) => params,
            Err(e) => {
                error!("Rejected create request: {}", e);
                return None;
            }
        };
        match self.manager.add_synchronizer_and_session(params).await {
            Ok((_, session_id)) => Some(session_id.to_string()),
            Err(e) => {
                error!("Failed to create session {}: {}", request.session_id, e);
                None
            }
        }
    }

    /// Starts joining a session. Returns the local client ID; `on_joined`
    /// then fires once with the join outcome (`None` on failure).
    pub async fn join_session(
        &self,
        request: &SessionRequest,
        on_joined: impl FnOnce(Option<JoinedSession>) + Send + 'static,
    ) -> Option<String> {
        let params = match request.to_params() {
            Ok(params) => params,
            Err(e) => {
                error!("Rejected join request: {}", e);
                return None;
            }
        };
        let callback = Box::new(move |result: SyncResult<JoinedSession>| on_joined(result.ok()));
        match self
            .manager
            .add_synchronizer_and_join_session(params, callback)
            .await
        {
            Ok((_, _, client_id)) => Some(client_id.to_string()),
            Err(e) => {
                error!("Failed to join session {}: {}", request.session_id, e);
                None
            }
        }
    }

    pub async fn destroy_session(&self, session_id: &str) -> bool {
        let Some(session_id) = parse::<SessionId>("session ID", session_id) else {
            return false;
        };
        self.manager
            .destroy_session(&session_id)
            .await
            .inspect_err(|e| error!("Failed to destroy session {}: {}", session_id, e))
            .is_ok()
    }

    pub async fn exit_session(&self, session_id: &str) -> bool {
        let Some(session_id) = parse::<SessionId>("session ID", session_id) else {
            return false;
        };
        self.manager
            .exit_session(&session_id)
            .await
            .inspect_err(|e| error!("Failed to exit session {}: {}", session_id, e))
            .is_ok()
    }

    pub async fn is_session_established(&self, session_id: &str) -> bool {
        match self.synchronizer(session_id) {
            Some(synchronizer) => synchronizer.is_session_established().await,
            None => false,
        }
    }

    /// Disconnects every session at `host:port`. Returns how many closed.
    pub async fn disconnect(&self, host: &str, port: u16) -> usize {
        self.manager.disconnect_endpoint(host, port).await
    }

    // ── Entities ─────────────────────────────────────────────────

    pub async fn start_synchronizing_entity(
        &self,
        session_id: &str,
        entity_id: &str,
        delete_with_client: bool,
        file_path: Option<String>,
        resources: Option<Vec<String>>,
    ) -> bool {
        let (Some(synchronizer), Some(entity_id)) = (
            self.synchronizer(session_id),
            parse::<EntityId>("entity ID", entity_id),
        ) else {
            return false;
        };
        let manifest = AssetManifest::from_parts(file_path, resources);
        synchronizer
            .add_synchronized_entity(entity_id, delete_with_client, manifest)
            .await
            .inspect_err(|e| warn!("Cannot synchronize entity {}: {}", entity_id, e))
            .is_ok()
    }

    pub async fn stop_synchronizing_entity(&self, session_id: &str, entity_id: &str) -> bool {
        let (Some(synchronizer), Some(entity_id)) = (
            self.synchronizer(session_id),
            parse::<EntityId>("entity ID", entity_id),
        ) else {
            return false;
        };
        synchronizer
            .remove_synchronized_entity(entity_id)
            .await
            .inspect_err(|e| warn!("Cannot stop synchronizing {}: {}", entity_id, e))
            .is_ok()
    }

    /// Publishes an entity's current transform.
    pub async fn update_entity(&self, session_id: &str, entity_id: &str) -> bool {
        let (Some(synchronizer), Some(entity_id)) = (
            self.synchronizer(session_id),
            parse::<EntityId>("entity ID", entity_id),
        ) else {
            return false;
        };
        synchronizer
            .update_synchronized_entity(entity_id)
            .await
            .inspect_err(|e| warn!("Cannot update entity {}: {}", entity_id, e))
            .is_ok()
    }

    // ── Messaging ────────────────────────────────────────────────

    pub async fn send_message(&self, session_id: &str, topic: &str, message: &str) -> bool {
        match self.synchronizer(session_id) {
            Some(synchronizer) => synchronizer.send_message(topic, message).await,
            None => false,
        }
    }

    /// Registers a callback `(topic, sender, message)` for a session.
    pub fn add_message_listener(
        &self,
        session_id: &str,
        callback: impl Fn(&str, &str, &str) + Send + Sync + 'static,
    ) -> Option<ListenerId> {
        let synchronizer = self.synchronizer(session_id)?;
        Some(synchronizer.add_message_listener(move |topic, sender: &ClientId, message| {
            callback(topic, sender.as_str(), message)
        }))
    }

    pub fn remove_message_listener(&self, session_id: &str, listener: ListenerId) -> bool {
        self.synchronizer(session_id)
            .is_some_and(|s| s.remove_message_listener(listener))
    }

    /// Display tag of a session member, if the session knows them.
    pub async fn get_user_tag(&self, session_id: &str, user_id: &str) -> Option<String> {
        let synchronizer = self.synchronizer(session_id)?;
        let user_id = parse::<ClientId>("user ID", user_id)?;
        synchronizer.get_user_tag(&user_id).await
    }

    fn synchronizer(&self, session_id: &str) -> Option<Synchronizer> {
        let session_id = parse::<SessionId>("session ID", session_id)?;
        let synchronizer = self.manager.get_synchronizer_for_session(&session_id);
        if synchronizer.is_none() {
            warn!("No synchronizer for session {}", session_id);
        }
        synchronizer
    }
}
