//! Inbound channel event handling.

use super::{Inner, Shared, Synchronizer, SynchronizerState};
use crate::error::SyncError;
use crate::events::{JoinCallback, JoinedSession, SessionEvent, SessionSnapshot, StateCallback};
use crate::protocol::{
    EntityAnnouncement, Envelope, SessionInfoMessage, SessionMessage, StateRequestMessage,
    StateSnapshotMessage,
};
use crate::session::{Member, SessionRole};
use crate::transport::{ChannelEvent, ChannelState};
use std::sync::Weak;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use worldsync_types::{ClientId, EntityId, SessionId, Transform};

/// Drains a channel's event queue until the synchronizer is dropped.
pub(super) async fn run(weak: Weak<Shared>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = weak.upgrade() else {
            break;
        };
        Synchronizer { shared }.handle_event(event).await;
    }
    debug!("Synchronizer event loop stopped");
}

impl Synchronizer {
    async fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message { topic, payload } => self.handle_message(&topic, &payload).await,
            ChannelEvent::StateChanged { old, new } => self.handle_channel_state(old, new).await,
            ChannelEvent::Error(message) => self.handle_channel_error(message).await,
        }
    }

    async fn handle_message(&self, topic: &str, payload: &[u8]) {
        // Cleared retained message.
        if payload.is_empty() {
            return;
        }
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping undecodable message on {}: {}", topic, e);
                return;
            }
        };
        if envelope.sender == self.shared.identity.client_id {
            return;
        }
        let sender = envelope.sender;
        debug!("Received {} from {} on {}", envelope.message.kind(), sender, topic);

        match envelope.message {
            SessionMessage::SessionInfo(info) => self.on_session_info(topic, info).await,
            SessionMessage::SessionClosed { session_id } => {
                self.on_session_closed(topic, &sender, session_id).await
            }
            SessionMessage::Presence(member) => self.on_presence(topic, &sender, member).await,
            SessionMessage::ClientLeft {
                client_id,
                graceful,
            } => self.on_client_left(topic, &sender, &client_id, graceful).await,
            SessionMessage::StateRequest(request) => {
                self.on_state_request(topic, &sender, request).await
            }
            SessionMessage::StateSnapshot(snapshot) => {
                self.on_state_snapshot(topic, snapshot).await
            }
            SessionMessage::EntityAnnounce(announcement) => {
                self.on_entity_announce(topic, &sender, announcement).await
            }
            SessionMessage::EntityUpdate {
                entity_id,
                transform,
            } => {
                self.on_entity_update(topic, &sender, entity_id, transform)
                    .await
            }
            SessionMessage::EntityRemove { entity_id } => {
                self.on_entity_remove(topic, &sender, entity_id).await
            }
            SessionMessage::App { payload, .. } => self.on_app(topic, &sender, &payload).await,
        }
    }

    // ── Session control ──────────────────────────────────────────

    async fn on_session_info(&self, topic: &str, info: SessionInfoMessage) {
        let mut inner = self.shared.inner.lock().await;
        if inner.session_for_topic(&self.shared.topics, topic) != Some(info.session_id) {
            return;
        }
        if let Some(session) = inner.session.as_mut() {
            if session.role == SessionRole::Joiner {
                session.tag = info.tag;
            }
            session.creator.get_or_insert(info.creator);
        }
    }

    async fn on_session_closed(&self, topic: &str, sender: &ClientId, session_id: SessionId) {
        let current = {
            let inner = self.shared.inner.lock().await;
            inner.session_for_topic(&self.shared.topics, topic)
        };
        if current != Some(session_id) {
            return;
        }
        info!("Session {} destroyed by {}", session_id, sender);
        self.emit(
            Some(session_id),
            vec![SessionEvent::SessionDestroyed { by: sender.clone() }],
        );
    }

    async fn on_presence(&self, topic: &str, sender: &ClientId, member: Member) {
        if &member.client_id != sender {
            warn!("Ignoring presence of {} sent by {}", member.client_id, sender);
            return;
        }
        let (session_id, joined) = {
            let mut inner = self.shared.inner.lock().await;
            let Some(session_id) = inner.session_for_topic(&self.shared.topics, topic) else {
                return;
            };
            let joined = inner
                .session
                .as_mut()
                .is_some_and(|s| s.upsert_member(member.clone()));
            (session_id, joined)
        };
        if joined {
            info!("{} ({}) joined session {}", member.client_id, member.tag, session_id);
            self.emit(Some(session_id), vec![SessionEvent::MemberJoined(member)]);
        }
    }

    async fn on_client_left(
        &self,
        topic: &str,
        sender: &ClientId,
        client_id: &ClientId,
        graceful: bool,
    ) {
        if client_id != sender {
            warn!("Ignoring departure of {} sent by {}", client_id, sender);
            return;
        }
        if client_id == &self.shared.identity.client_id {
            return;
        }
        let mut events = Vec::new();
        let session_id = {
            let mut inner = self.shared.inner.lock().await;
            let Some(session_id) = inner.session_for_topic(&self.shared.topics, topic) else {
                return;
            };
            let was_member = inner
                .session
                .as_mut()
                .and_then(|s| s.remove_member(client_id))
                .is_some();
            if was_member {
                events.push(SessionEvent::MemberLeft {
                    client_id: client_id.clone(),
                    graceful,
                });
            }
            for entity in inner.registry.remove_deletable_owned_by(client_id) {
                self.destroy_replica(&entity.entity_id);
                events.push(SessionEvent::EntityRemoved(entity.entity_id));
            }
            session_id
        };
        if graceful {
            info!("{} left session {}", client_id, session_id);
        } else {
            warn!("{} dropped out of session {}", client_id, session_id);
        }
        self.emit(Some(session_id), events);
    }

    // ── State transfer ───────────────────────────────────────────

    async fn on_state_request(&self, topic: &str, sender: &ClientId, request: StateRequestMessage) {
        if &request.requester != sender {
            warn!("Ignoring state request for {} sent by {}", request.requester, sender);
            return;
        }
        let shared = &self.shared;
        let _op = shared.op_lock.lock().await;
        let (session_id, snapshot) = {
            let inner = shared.inner.lock().await;
            let Some(session_id) = inner.session_for_topic(&shared.topics, topic) else {
                return;
            };
            if !inner.state.is_session_active() {
                return;
            }
            let Some(session) = inner.session.as_ref() else {
                return;
            };
            let offset = session.world_offset;
            let snapshot = StateSnapshotMessage {
                request_id: request.request_id,
                session_tag: session.tag.clone(),
                members: session.members(),
                entities: inner
                    .registry
                    .snapshot()
                    .iter()
                    .map(|entity| self.announcement(entity, offset))
                    .collect(),
            };
            (session_id, snapshot)
        };

        let inbox = shared.topics.state_inbox(&session_id, &request.requester);
        let entity_count = snapshot.entities.len();
        match self
            .publish(&inbox, SessionMessage::StateSnapshot(snapshot), false)
            .await
        {
            Ok(()) => debug!(
                "Sent state of {} ({} entities) to {}",
                session_id, entity_count, request.requester
            ),
            Err(e) => warn!("Failed to send state to {}: {}", request.requester, e),
        }
    }

    async fn on_state_snapshot(&self, topic: &str, snapshot: StateSnapshotMessage) {
        let shared = &self.shared;
        let me = shared.identity.client_id.clone();
        let mut events = Vec::new();

        let (session_id, completion) = {
            let mut inner = shared.inner.lock().await;
            let Some(session_id) = inner.session_id() else {
                return;
            };
            if topic != shared.topics.state_inbox(&session_id, &me) {
                return;
            }

            let join = inner
                .pending_join
                .as_ref()
                .is_some_and(|p| p.request_id == snapshot.request_id);
            let state_callback = if join {
                None
            } else {
                match inner.pending_state.remove(&snapshot.request_id) {
                    Some(callback) => Some(callback),
                    None => {
                        debug!("Ignoring snapshot for request {}", snapshot.request_id);
                        return;
                    }
                }
            };

            self.apply_snapshot(&mut inner, snapshot, &mut events);

            let completion = if join {
                let pending = inner.pending_join.take();
                inner.set_state(SynchronizerState::SessionActive(SessionRole::Joiner), &mut events);
                pending
                    .zip(Self::joined(&inner, &me))
                    .map(|(p, joined)| Completion::Join(p.callback, joined))
            } else {
                state_callback.zip(inner.snapshot()).map(|(cb, s)| Completion::State(cb, s))
            };
            (session_id, completion.map(|c| (c, inner.epoch)))
        };

        self.emit(Some(session_id), events);
        match completion {
            Some((Completion::Join(callback, joined), epoch)) => {
                info!(
                    "Joined session {} ({} members, {} entities)",
                    session_id, joined.member_count, joined.entity_count
                );
                callback(Ok(joined));
                self.spawn_reannounce(epoch);
            }
            Some((Completion::State(callback, snapshot), _)) => callback(Ok(snapshot)),
            None => {}
        }
    }

    fn joined(inner: &Inner, me: &ClientId) -> Option<JoinedSession> {
        inner.session.as_ref().map(|session| JoinedSession {
            session_id: session.id,
            local_client_id: me.clone(),
            session_tag: session.tag.clone(),
            member_count: session.member_count(),
            entity_count: inner.registry.len(),
        })
    }

    /// Merges a snapshot into the local session state.
    fn apply_snapshot(
        &self,
        inner: &mut Inner,
        snapshot: StateSnapshotMessage,
        events: &mut Vec<SessionEvent>,
    ) {
        let me = &self.shared.identity.client_id;
        if let Some(session) = inner.session.as_mut() {
            if session.role == SessionRole::Joiner {
                session.tag = snapshot.session_tag;
            }
            for member in snapshot.members {
                if &member.client_id != me && session.upsert_member(member.clone()) {
                    events.push(SessionEvent::MemberJoined(member));
                }
            }
        }
        for announcement in snapshot.entities {
            self.apply_announcement(inner, announcement, events);
        }
    }

    // ── Entities ─────────────────────────────────────────────────

    async fn on_entity_announce(
        &self,
        topic: &str,
        sender: &ClientId,
        announcement: EntityAnnouncement,
    ) {
        if &announcement.owner != sender {
            warn!(
                "Ignoring announcement of {} owned by {} sent by {}",
                announcement.entity_id, announcement.owner, sender
            );
            return;
        }
        let mut events = Vec::new();
        let session_id = {
            let mut inner = self.shared.inner.lock().await;
            let Some(session_id) = self.entities_session(&inner, topic) else {
                return;
            };
            self.apply_announcement(&mut inner, announcement, &mut events);
            session_id
        };
        self.emit(Some(session_id), events);
    }

    /// Registers (or refreshes) a remote entity and materializes it.
    /// Announcing a known entity again counts as an update. An entity
    /// registered under another owner is left untouched.
    fn apply_announcement(
        &self,
        inner: &mut Inner,
        announcement: EntityAnnouncement,
        events: &mut Vec<SessionEvent>,
    ) {
        let Some(offset) = inner.session.as_ref().map(|s| s.world_offset) else {
            return;
        };
        if let Some(existing) = inner.registry.get(&announcement.entity_id) {
            if existing.owner != announcement.owner {
                warn!(
                    "Ignoring announcement of {} by {}: owned by {}",
                    announcement.entity_id, announcement.owner, existing.owner
                );
                return;
            }
        }
        let entity = announcement.to_entity();
        let entity_id = entity.entity_id;
        let is_new = inner.registry.upsert(entity.clone());

        let model = &self.shared.entity_model;
        let local = announcement.transform.to_local_space(offset);
        match model.find_entity(&entity_id) {
            Some(handle) => model.apply_remote_transform(handle, &local),
            None => {
                let created =
                    model.create_entity_from_manifest(entity_id, announcement.manifest.as_ref(), &local);
                if created.is_none() {
                    warn!("Entity model could not materialize {}", entity_id);
                }
            }
        }

        if is_new {
            debug!("Entity {} announced by {}", entity_id, entity.owner);
            events.push(SessionEvent::EntityAdded(entity));
        } else {
            events.push(SessionEvent::EntityUpdated(entity_id));
        }
    }

    async fn on_entity_update(
        &self,
        topic: &str,
        sender: &ClientId,
        entity_id: EntityId,
        transform: Transform,
    ) {
        let session_id = {
            let inner = self.shared.inner.lock().await;
            let Some(session_id) = self.entities_session(&inner, topic) else {
                return;
            };
            if !self.sent_by_owner(&inner, &entity_id, sender) {
                return;
            }
            let Some(offset) = inner.session.as_ref().map(|s| s.world_offset) else {
                return;
            };
            let model = &self.shared.entity_model;
            match model.find_entity(&entity_id) {
                Some(handle) => {
                    model.apply_remote_transform(handle, &transform.to_local_space(offset))
                }
                None => debug!("Update for {} has no local entity", entity_id),
            }
            session_id
        };
        self.emit(Some(session_id), vec![SessionEvent::EntityUpdated(entity_id)]);
    }

    async fn on_entity_remove(&self, topic: &str, sender: &ClientId, entity_id: EntityId) {
        let session_id = {
            let mut inner = self.shared.inner.lock().await;
            let Some(session_id) = self.entities_session(&inner, topic) else {
                return;
            };
            if !self.sent_by_owner(&inner, &entity_id, sender) {
                return;
            }
            inner.registry.remove(&entity_id);
            self.destroy_replica(&entity_id);
            session_id
        };
        debug!("Entity {} removed by {}", entity_id, sender);
        self.emit(Some(session_id), vec![SessionEvent::EntityRemoved(entity_id)]);
    }

    fn entities_session(&self, inner: &Inner, topic: &str) -> Option<SessionId> {
        let session_id = inner.session_for_topic(&self.shared.topics, topic)?;
        (topic == self.shared.topics.entities(&session_id)).then_some(session_id)
    }

    fn sent_by_owner(&self, inner: &Inner, entity_id: &EntityId, sender: &ClientId) -> bool {
        match inner.registry.get(entity_id) {
            Some(entity) if &entity.owner == sender => true,
            Some(entity) => {
                warn!(
                    "Ignoring change to {} from {}: owned by {}",
                    entity_id, sender, entity.owner
                );
                false
            }
            None => {
                debug!("Ignoring change to unknown entity {}", entity_id);
                false
            }
        }
    }

    fn destroy_replica(&self, entity_id: &EntityId) {
        let model = &self.shared.entity_model;
        if let Some(handle) = model.find_entity(entity_id) {
            model.destroy_entity(handle);
        }
    }

    // ── Application messages ─────────────────────────────────────

    async fn on_app(&self, topic: &str, sender: &ClientId, payload: &str) {
        let app_topic = {
            let inner = self.shared.inner.lock().await;
            let Some(session_id) = inner.session_for_topic(&self.shared.topics, topic) else {
                return;
            };
            match self.shared.topics.app_topic(&session_id, topic) {
                Some(app_topic) => app_topic.to_string(),
                None => return,
            }
        };
        let callbacks = self.listeners().message_callbacks();
        for callback in callbacks {
            callback(&app_topic, sender, payload);
        }
    }

    // ── Channel state ────────────────────────────────────────────

    async fn handle_channel_state(&self, old: ChannelState, new: ChannelState) {
        debug!(
            "Channel to {} {} -> {}",
            self.shared.connection.endpoint, old, new
        );
        if new != ChannelState::Disconnected || self.shared.channel.is_connected() {
            return;
        }

        let mut events = Vec::new();
        let (session_id, pending_join, pending_state) = {
            let mut inner = self.shared.inner.lock().await;
            if !inner.state.is_connected() {
                return;
            }
            let pending_join = inner.pending_join.take();
            let pending_state = std::mem::take(&mut inner.pending_state);
            let session_id = inner.clear_session().map(|s| s.id);
            inner.set_state(SynchronizerState::Disconnected, &mut events);
            (session_id, pending_join, pending_state)
        };

        warn!("Connection to {} lost", self.shared.connection.endpoint);
        events.push(SessionEvent::Error(format!(
            "connection to {} lost",
            self.shared.connection.endpoint
        )));
        self.emit(session_id, events);

        if let Some(pending) = pending_join {
            (pending.callback)(Err(SyncError::NotConnected));
        }
        for (_, callback) in pending_state {
            callback(Err(SyncError::NotConnected));
        }
    }

    async fn handle_channel_error(&self, message: String) {
        warn!("Channel to {} reported: {}", self.shared.connection.endpoint, message);
        let session_id = self.shared.inner.lock().await.session_id();
        self.emit(session_id, vec![SessionEvent::Error(message)]);
    }
}

enum Completion {
    Join(JoinCallback, JoinedSession),
    State(StateCallback, SessionSnapshot),
}
