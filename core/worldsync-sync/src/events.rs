//! Typed session events and application callbacks.
//!
//! Applications (or a scripting bridge) observe a synchronizer through
//! [`SessionEventHandler`] implementations and message callbacks. Callbacks
//! run on the synchronizer's event-loop task, never while it holds its
//! internal locks.

use crate::error::SyncResult;
use crate::registry::SynchronizedEntity;
use crate::session::Member;
use crate::synchronizer::SynchronizerState;
use std::sync::Arc;
use worldsync_types::{ClientId, EntityId, SessionId};

/// Invoked for every inbound application message: `(topic, sender, payload)`.
pub type MessageCallback = Arc<dyn Fn(&str, &ClientId, &str) + Send + Sync>;

/// Completion of a join: fires exactly once per accepted join.
pub type JoinCallback = Box<dyn FnOnce(SyncResult<JoinedSession>) + Send>;

/// Completion of a session state request.
pub type StateCallback = Box<dyn FnOnce(SyncResult<SessionSnapshot>) + Send>;

/// Handle for removing a message listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Outcome of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedSession {
    pub session_id: SessionId,
    pub local_client_id: ClientId,
    pub session_tag: String,
    pub member_count: usize,
    pub entity_count: usize,
}

/// Local view of a session's replicated state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub tag: String,
    pub members: Vec<Member>,
    pub entities: Vec<SynchronizedEntity>,
}

/// Something that happened to a synchronizer or its session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        old: SynchronizerState,
        new: SynchronizerState,
    },
    MemberJoined(Member),
    MemberLeft {
        client_id: ClientId,
        graceful: bool,
    },
    EntityAdded(SynchronizedEntity),
    EntityUpdated(EntityId),
    EntityRemoved(EntityId),
    /// A peer tore the session down. Whether to exit is up to the handler.
    SessionDestroyed {
        by: ClientId,
    },
    Error(String),
}

/// Receives session events. Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait SessionEventHandler: Send + Sync {
    fn on_state_changed(
        &self,
        session: Option<SessionId>,
        old: SynchronizerState,
        new: SynchronizerState,
    ) {
    }

    fn on_member_joined(&self, session: SessionId, member: &Member) {}

    fn on_member_left(&self, session: SessionId, client_id: &ClientId, graceful: bool) {}

    fn on_entity_added(&self, session: SessionId, entity: &SynchronizedEntity) {}

    fn on_entity_updated(&self, session: SessionId, entity_id: EntityId) {}

    fn on_entity_removed(&self, session: SessionId, entity_id: EntityId) {}

    fn on_session_destroyed(&self, session: SessionId, by: &ClientId) {}

    fn on_error(&self, session: Option<SessionId>, error: &str) {}
}

/// Routes an event to the matching handler method.
///
/// Session-scoped events without a session are dropped.
pub fn dispatch(handler: &dyn SessionEventHandler, session: Option<SessionId>, event: &SessionEvent) {
    match (event, session) {
        (SessionEvent::StateChanged { old, new }, _) => {
            handler.on_state_changed(session, *old, *new)
        }
        (SessionEvent::Error(message), _) => handler.on_error(session, message),
        (SessionEvent::MemberJoined(member), Some(s)) => handler.on_member_joined(s, member),
        (SessionEvent::MemberLeft { client_id, graceful }, Some(s)) => {
            handler.on_member_left(s, client_id, *graceful)
        }
        (SessionEvent::EntityAdded(entity), Some(s)) => handler.on_entity_added(s, entity),
        (SessionEvent::EntityUpdated(id), Some(s)) => handler.on_entity_updated(s, *id),
        (SessionEvent::EntityRemoved(id), Some(s)) => handler.on_entity_removed(s, *id),
        (SessionEvent::SessionDestroyed { by }, Some(s)) => handler.on_session_destroyed(s, by),
        (_, None) => {}
    }
}

/// Registered callbacks of one synchronizer.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    messages: Vec<(ListenerId, MessageCallback)>,
    handlers: Vec<Arc<dyn SessionEventHandler>>,
}

impl Listeners {
    pub(crate) fn add_message(&mut self, callback: MessageCallback) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.messages.push((id, callback));
        id
    }

    pub(crate) fn remove_message(&mut self, id: ListenerId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|(lid, _)| *lid != id);
        self.messages.len() != before
    }

    pub(crate) fn add_handler(&mut self, handler: Arc<dyn SessionEventHandler>) {
        self.handlers.push(handler);
    }

    /// Message callbacks in registration order.
    pub(crate) fn message_callbacks(&self) -> Vec<MessageCallback> {
        self.messages.iter().map(|(_, cb)| cb.clone()).collect()
    }

    pub(crate) fn handlers(&self) -> Vec<Arc<dyn SessionEventHandler>> {
        self.handlers.clone()
    }

    pub(crate) fn message_listener_count(&self) -> usize {
        self.messages.len()
    }
}
