//! Session synchronizer.
//!
//! A [`Synchronizer`] owns one message channel to one broker endpoint and
//! hosts at most one session at a time, either as its creator or as a
//! joiner. It keeps the session's membership and synchronized entity
//! registry, publishes local changes, and applies remote ones through the
//! entity model.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Joining -> SessionActive(Joiner)
//!                                   |                         |
//!                                   +--> SessionActive(Creator)
//!                                                             |
//!                     Disconnected <- Disconnecting <---------+
//! ```
//!
//! Local operations are serialized, so publishes for one entity leave in
//! the order the calls were made. Inbound traffic is handled on a spawned
//! event-loop task that only holds a weak reference to the synchronizer.

mod inbound;

use crate::entity_model::{AssetManifest, EntityModel};
use crate::error::{SyncError, SyncResult};
use crate::events::{
    JoinCallback, ListenerId, Listeners, SessionEvent, SessionEventHandler,
    SessionSnapshot, StateCallback, dispatch,
};
use crate::identity::{ClientIdentity, ResolvedIdentity};
use crate::protocol::{
    EntityAnnouncement, Envelope, SessionInfoMessage, SessionMessage, StateRequestMessage,
};
use crate::registry::{SynchronizedEntity, SynchronizedEntityRegistry};
use crate::session::{Member, Session, SessionRole};
use crate::topics::{DEFAULT_TOPIC_ROOT, TopicScheme};
use crate::transport::{ConnectOptions, LastWill, MessageChannel, QoS};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use worldsync_types::{ClientId, Endpoint, EntityId, SessionId, TransportKind, Vector3};

/// Lifecycle state of a synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynchronizerState {
    Disconnected,
    Connecting,
    Connected,
    /// Join handshake in flight.
    Joining,
    SessionActive(SessionRole),
    Disconnecting,
}

impl SynchronizerState {
    pub fn is_session_active(&self) -> bool {
        matches!(self, Self::SessionActive(_))
    }

    /// Connected to the broker, with or without a session.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Joining | Self::SessionActive(_)
        )
    }
}

impl fmt::Display for SynchronizerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Joining => f.write_str("joining"),
            Self::SessionActive(SessionRole::Creator) => f.write_str("session active (creator)"),
            Self::SessionActive(SessionRole::Joiner) => f.write_str("session active (joiner)"),
            Self::Disconnecting => f.write_str("disconnecting"),
        }
    }
}

/// Configuration for a synchronizer.
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// Root of the topic namespace.
    pub topic_root: String,
    /// QoS used for every publish.
    pub qos: QoS,
    /// How long a join waits for a state snapshot (ms).
    pub join_timeout_ms: u64,
    /// Keep-alive interval requested from the broker (seconds).
    pub keep_alive_secs: u16,
    /// Re-announce locally owned entities at this interval (ms).
    /// `None` disables re-announcement.
    pub reannounce_interval_ms: Option<u64>,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            topic_root: DEFAULT_TOPIC_ROOT.to_string(),
            qos: QoS::AtLeastOnce,
            join_timeout_ms: 10_000,
            keep_alive_secs: 30,
            reannounce_interval_ms: None,
        }
    }
}

/// Where and how a synchronizer connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchronizerConnection {
    pub endpoint: Endpoint,
    pub tls: bool,
    pub transport: TransportKind,
    /// Session the connection is dedicated to. Arms the last will.
    pub session_id: Option<SessionId>,
}

impl SynchronizerConnection {
    pub fn new(endpoint: Endpoint, transport: TransportKind, tls: bool) -> Self {
        Self {
            endpoint,
            tls,
            transport,
            session_id: None,
        }
    }

    /// Dedicates the connection to `session_id`.
    pub fn for_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

struct PendingJoin {
    request_id: Uuid,
    callback: JoinCallback,
}

struct Inner {
    state: SynchronizerState,
    session: Option<Session>,
    registry: SynchronizedEntityRegistry,
    pending_join: Option<PendingJoin>,
    pending_state: HashMap<Uuid, StateCallback>,
    /// Bumped whenever the hosted session is replaced or dropped.
    epoch: u64,
}

impl Inner {
    fn set_state(&mut self, new: SynchronizerState, events: &mut Vec<SessionEvent>) {
        let old = std::mem::replace(&mut self.state, new);
        if old != new {
            debug!("Synchronizer state {} -> {}", old, new);
            events.push(SessionEvent::StateChanged { old, new });
        }
    }

    fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Drops the hosted session. Pending completions are discarded unfired.
    fn clear_session(&mut self) -> Option<Session> {
        self.pending_join = None;
        self.pending_state.clear();
        self.registry.clear();
        self.epoch += 1;
        self.session.take()
    }

    fn snapshot(&self) -> Option<SessionSnapshot> {
        self.session.as_ref().map(|session| SessionSnapshot {
            session_id: session.id,
            tag: session.tag.clone(),
            members: session.members(),
            entities: self.registry.snapshot(),
        })
    }

    /// Returns the hosted session if `topic` lies in its namespace.
    fn session_for_topic(&self, topics: &TopicScheme, topic: &str) -> Option<SessionId> {
        let id = self.session_id()?;
        let root = topics.session_root(&id);
        topic
            .strip_prefix(root.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
            .then_some(id)
    }
}

struct Shared {
    connection: SynchronizerConnection,
    identity: ResolvedIdentity,
    channel: Arc<dyn MessageChannel>,
    entity_model: Arc<dyn EntityModel>,
    config: SynchronizerConfig,
    topics: TopicScheme,
    inner: Mutex<Inner>,
    listeners: std::sync::Mutex<Listeners>,
    /// Serializes local operations. Taken before `inner`, never after.
    op_lock: Mutex<()>,
    event_loop_started: AtomicBool,
}

/// Synchronizes one session over one broker connection.
///
/// Cloning yields another handle to the same synchronizer.
#[derive(Clone)]
pub struct Synchronizer {
    shared: Arc<Shared>,
}

/// Non-owning handle to a [`Synchronizer`].
#[derive(Clone)]
pub struct WeakSynchronizer(Weak<Shared>);

impl WeakSynchronizer {
    pub fn upgrade(&self) -> Option<Synchronizer> {
        self.0.upgrade().map(|shared| Synchronizer { shared })
    }
}

impl fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("endpoint", &self.shared.connection.endpoint)
            .field("client_id", &self.shared.identity.client_id)
            .finish_non_exhaustive()
    }
}

impl Synchronizer {
    /// Creates a disconnected synchronizer. Resolves the client identity,
    /// so an anonymous identity gets its ephemeral client ID here.
    pub fn new(
        connection: SynchronizerConnection,
        identity: &ClientIdentity,
        channel: Arc<dyn MessageChannel>,
        entity_model: Arc<dyn EntityModel>,
        config: SynchronizerConfig,
    ) -> SyncResult<Self> {
        let identity = identity.resolve()?;
        let topics = TopicScheme::new(config.topic_root.clone())?;
        Ok(Self {
            shared: Arc::new(Shared {
                connection,
                identity,
                channel,
                entity_model,
                config,
                topics,
                inner: Mutex::new(Inner {
                    state: SynchronizerState::Disconnected,
                    session: None,
                    registry: SynchronizedEntityRegistry::new(),
                    pending_join: None,
                    pending_state: HashMap::new(),
                    epoch: 0,
                }),
                listeners: std::sync::Mutex::new(Listeners::default()),
                op_lock: Mutex::new(()),
                event_loop_started: AtomicBool::new(false),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakSynchronizer {
        WeakSynchronizer(Arc::downgrade(&self.shared))
    }

    /// Whether both handles refer to the same synchronizer.
    pub fn ptr_eq(&self, other: &Synchronizer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn connection(&self) -> &SynchronizerConnection {
        &self.shared.connection
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.connection.endpoint
    }

    /// Client ID this synchronizer presents to the broker and its peers.
    pub fn local_client_id(&self) -> &ClientId {
        &self.shared.identity.client_id
    }

    /// Display tag of the local client.
    pub fn local_tag(&self) -> &str {
        &self.shared.identity.tag
    }

    pub fn config(&self) -> &SynchronizerConfig {
        &self.shared.config
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.shared.topics
    }

    pub async fn state(&self) -> SynchronizerState {
        self.shared.inner.lock().await.state
    }

    pub async fn is_session_established(&self) -> bool {
        self.state().await.is_session_active()
    }

    /// ID of the hosted session, including one still being joined.
    pub async fn session_id(&self) -> Option<SessionId> {
        self.shared.inner.lock().await.session_id()
    }

    pub async fn session_tag(&self) -> Option<String> {
        let inner = self.shared.inner.lock().await;
        inner.session.as_ref().map(|s| s.tag.clone())
    }

    pub async fn world_offset(&self) -> Option<Vector3> {
        let inner = self.shared.inner.lock().await;
        inner.session.as_ref().map(|s| s.world_offset)
    }

    pub async fn members(&self) -> Vec<Member> {
        let inner = self.shared.inner.lock().await;
        inner.session.as_ref().map(Session::members).unwrap_or_default()
    }

    /// Synchronized entities in registration order.
    pub async fn synchronized_entities(&self) -> Vec<SynchronizedEntity> {
        self.shared.inner.lock().await.registry.snapshot()
    }

    pub async fn is_synchronizing(&self, entity_id: &EntityId) -> bool {
        self.shared.inner.lock().await.registry.contains(entity_id)
    }

    /// Looks up a session member's display tag.
    pub async fn get_user_tag(&self, client_id: &ClientId) -> Option<String> {
        if client_id == self.local_client_id() {
            return Some(self.shared.identity.tag.clone());
        }
        let inner = self.shared.inner.lock().await;
        inner
            .session
            .as_ref()
            .and_then(|s| s.member(client_id))
            .map(|m| m.tag.clone())
    }

    // ── Listeners ────────────────────────────────────────────────

    /// Registers a callback for inbound application messages. Callbacks run
    /// in registration order.
    pub fn add_message_listener(
        &self,
        callback: impl Fn(&str, &ClientId, &str) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners().add_message(Arc::new(callback))
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.listeners().remove_message(id)
    }

    pub fn message_listener_count(&self) -> usize {
        self.listeners().message_listener_count()
    }

    pub fn add_event_handler(&self, handler: Arc<dyn SessionEventHandler>) {
        self.listeners().add_handler(handler);
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Connects to the broker. Connecting a connected synchronizer is a no-op.
    pub async fn connect(&self) -> SyncResult<()> {
        let shared = &self.shared;
        let _op = shared.op_lock.lock().await;
        let options = self.connect_options()?;

        let mut events = Vec::new();
        {
            let mut inner = shared.inner.lock().await;
            match inner.state {
                SynchronizerState::Disconnected => {
                    inner.set_state(SynchronizerState::Connecting, &mut events)
                }
                SynchronizerState::Connecting | SynchronizerState::Disconnecting => {
                    return Err(SyncError::InvalidState(format!(
                        "cannot connect while {}",
                        inner.state
                    )));
                }
                _ => {
                    debug!("Already connected to {}", shared.connection.endpoint);
                    return Ok(());
                }
            }
        }
        self.emit(None, events);
        self.start_event_loop();

        let result = shared.channel.connect(options).await;

        let mut events = Vec::new();
        {
            let mut inner = shared.inner.lock().await;
            match &result {
                Ok(()) => {
                    info!(
                        "Connected to {} as {}",
                        shared.connection.endpoint, shared.identity.client_id
                    );
                    inner.set_state(SynchronizerState::Connected, &mut events);
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", shared.connection.endpoint, e);
                    inner.set_state(SynchronizerState::Disconnected, &mut events);
                }
            }
        }
        self.emit(None, events);
        result
    }

    /// Leaves the hosted session (if any) and closes the connection.
    ///
    /// Entities this client owns with delete-with-client set are removed
    /// before the channel closes. Disconnecting twice is a no-op.
    pub async fn disconnect(&self) -> SyncResult<()> {
        let shared = &self.shared;
        let _op = shared.op_lock.lock().await;
        if shared.inner.lock().await.state == SynchronizerState::Disconnected {
            debug!("Disconnect ignored: {} not connected", shared.connection.endpoint);
            return Ok(());
        }

        self.leave_session(false).await;

        let mut events = Vec::new();
        let session_id = {
            let mut inner = shared.inner.lock().await;
            let session_id = inner.clear_session().map(|s| s.id);
            inner.set_state(SynchronizerState::Disconnecting, &mut events);
            session_id
        };
        self.emit(session_id, events);

        if let Err(e) = shared.channel.disconnect().await {
            warn!("Error closing channel to {}: {}", shared.connection.endpoint, e);
        }

        let mut events = Vec::new();
        shared
            .inner
            .lock()
            .await
            .set_state(SynchronizerState::Disconnected, &mut events);
        self.emit(None, events);
        info!("Disconnected from {}", shared.connection.endpoint);
        Ok(())
    }

    // ── Session lifecycle ────────────────────────────────────────

    /// Creates a session and becomes its creator.
    ///
    /// Creation is optimistic: the session is active as soon as its
    /// metadata is published.
    pub async fn create_session(
        &self,
        session_id: SessionId,
        tag: impl Into<String>,
        world_offset: Vector3,
    ) -> SyncResult<()> {
        let shared = &self.shared;
        let _op = shared.op_lock.lock().await;
        let tag = tag.into();
        let me = shared.identity.client_id.clone();
        self.warn_if_will_mismatch(&session_id);

        let mut session = Session::new(
            session_id,
            tag.clone(),
            world_offset,
            shared.connection.transport,
            shared.connection.tls,
            SessionRole::Creator,
        );
        session.creator = Some(me.clone());
        session.upsert_member(Member::new(me.clone(), shared.identity.tag.clone()));

        let mut events = Vec::new();
        let epoch = {
            let mut inner = shared.inner.lock().await;
            Self::check_can_host(inner.state)?;
            inner.clear_session();
            inner.session = Some(session);
            inner.set_state(SynchronizerState::SessionActive(SessionRole::Creator), &mut events);
            inner.epoch
        };
        self.emit(Some(session_id), events);

        let info = SessionMessage::SessionInfo(SessionInfoMessage {
            session_id,
            tag: tag.clone(),
            creator: me.clone(),
            world_offset,
        });
        let presence = SessionMessage::Presence(Member::new(me, shared.identity.tag.clone()));
        let announced = async {
            self.subscribe_session(&session_id).await?;
            self.publish(&shared.topics.info(&session_id), info, true)
                .await?;
            self.publish(&shared.topics.control(&session_id), presence, false)
                .await
        }
        .await;

        if let Err(e) = announced {
            warn!("Failed to create session {}: {}", session_id, e);
            self.abandon_session(epoch).await;
            return Err(e);
        }

        info!("Created session {} ({})", session_id, tag);
        self.spawn_reannounce(epoch);
        Ok(())
    }

    /// Joins an existing session.
    ///
    /// Subscribes, announces presence and asks the members for the current
    /// session state. `on_joined` fires exactly once if this returns `Ok`:
    /// after the snapshot has been applied locally, or with an error if the
    /// join times out or the connection drops first. It does not fire if
    /// the session is exited or destroyed while the join is in flight.
    pub async fn join_session(
        &self,
        session_id: SessionId,
        world_offset: Vector3,
        on_joined: JoinCallback,
    ) -> SyncResult<()> {
        let shared = &self.shared;
        let _op = shared.op_lock.lock().await;
        let me = shared.identity.client_id.clone();
        self.warn_if_will_mismatch(&session_id);

        let mut session = Session::new(
            session_id,
            String::new(),
            world_offset,
            shared.connection.transport,
            shared.connection.tls,
            SessionRole::Joiner,
        );
        session.upsert_member(Member::new(me.clone(), shared.identity.tag.clone()));
        let request = StateRequestMessage::new(me.clone());
        let request_id = request.request_id;

        let mut events = Vec::new();
        let epoch = {
            let mut inner = shared.inner.lock().await;
            Self::check_can_host(inner.state)?;
            inner.clear_session();
            inner.session = Some(session);
            inner.pending_join = Some(PendingJoin {
                request_id,
                callback: on_joined,
            });
            inner.set_state(SynchronizerState::Joining, &mut events);
            inner.epoch
        };
        self.emit(Some(session_id), events);

        let presence = SessionMessage::Presence(Member::new(me, shared.identity.tag.clone()));
        let control = shared.topics.control(&session_id);
        let requested = async {
            self.subscribe_session(&session_id).await?;
            self.publish(&control, presence, false).await?;
            self.publish(&control, SessionMessage::StateRequest(request), false)
                .await
        }
        .await;

        if let Err(e) = requested {
            warn!("Failed to join session {}: {}", session_id, e);
            self.abandon_session(epoch).await;
            return Err(e);
        }

        info!("Joining session {}", session_id);
        self.spawn_join_timeout(request_id);
        Ok(())
    }

    /// Tears the session down for every member and leaves it.
    pub async fn destroy_session(&self) -> SyncResult<()> {
        let _op = self.shared.op_lock.lock().await;
        {
            let inner = self.shared.inner.lock().await;
            match &inner.session {
                None => {
                    debug!("Destroy ignored: no session");
                    return Ok(());
                }
                Some(session) if !session.is_creator() => {
                    warn!("Destroying session {} created by another client", session.id);
                }
                Some(_) => {}
            }
        }
        self.leave_session(true).await;
        Ok(())
    }

    /// Leaves the hosted session. Exiting twice is a no-op.
    pub async fn exit_session(&self) -> SyncResult<()> {
        let _op = self.shared.op_lock.lock().await;
        self.leave_session(false).await;
        Ok(())
    }

    /// Asks the other members for the session state and merges the answer.
    ///
    /// With no other members, the callback fires immediately with the local
    /// view. If this returns `Ok`, the callback fires exactly once unless
    /// the session is left first.
    pub async fn get_session_state(&self, on_state: StateCallback) -> SyncResult<()> {
        let shared = &self.shared;
        let _op = shared.op_lock.lock().await;
        let me = shared.identity.client_id.clone();
        let request = StateRequestMessage::new(me);
        let request_id = request.request_id;

        let session_id = {
            let mut inner = shared.inner.lock().await;
            let (session_id, _) = Self::active_session(&inner)?;
            let alone = inner
                .session
                .as_ref()
                .is_some_and(|s| s.member_count() <= 1);
            if alone {
                let snapshot = inner.snapshot();
                drop(inner);
                debug!("Session {} has no other members, answering locally", session_id);
                match snapshot {
                    Some(snapshot) => on_state(Ok(snapshot)),
                    None => on_state(Err(SyncError::UnknownSession(session_id))),
                }
                return Ok(());
            }
            inner.pending_state.insert(request_id, on_state);
            session_id
        };

        let control = shared.topics.control(&session_id);
        if let Err(e) = self
            .publish(&control, SessionMessage::StateRequest(request), false)
            .await
        {
            shared.inner.lock().await.pending_state.remove(&request_id);
            return Err(e);
        }
        self.spawn_state_timeout(request_id);
        Ok(())
    }

    // ── Synchronized entities ────────────────────────────────────

    /// Starts synchronizing a local entity and announces it to the session.
    pub async fn add_synchronized_entity(
        &self,
        entity_id: EntityId,
        delete_with_client: bool,
        manifest: Option<AssetManifest>,
    ) -> SyncResult<()> {
        let shared = &self.shared;
        let _op = shared.op_lock.lock().await;
        let me = shared.identity.client_id.clone();

        let (session_id, entity, announcement) = {
            let mut inner = shared.inner.lock().await;
            let (session_id, offset) = Self::active_session(&inner)?;
            let handle = shared
                .entity_model
                .find_entity(&entity_id)
                .ok_or(SyncError::UnknownEntity(entity_id))?;
            let transform = shared
                .entity_model
                .transform(handle)
                .unwrap_or_default();
            let entity =
                SynchronizedEntity::new(entity_id, me, delete_with_client).with_manifest(manifest);
            inner.registry.insert(entity.clone())?;
            let announcement =
                EntityAnnouncement::new(&entity, transform.to_session_space(offset));
            (session_id, entity, announcement)
        };

        let topic = shared.topics.entities(&session_id);
        if let Err(e) = self
            .publish(&topic, SessionMessage::EntityAnnounce(announcement), false)
            .await
        {
            warn!("Failed to announce entity {}: {}", entity_id, e);
            shared.inner.lock().await.registry.remove(&entity_id);
            return Err(e);
        }

        debug!("Synchronizing entity {} in session {}", entity_id, session_id);
        self.emit(Some(session_id), vec![SessionEvent::EntityAdded(entity)]);
        Ok(())
    }

    /// Stops synchronizing an entity this client owns.
    pub async fn remove_synchronized_entity(&self, entity_id: EntityId) -> SyncResult<()> {
        let shared = &self.shared;
        let _op = shared.op_lock.lock().await;

        let session_id = {
            let inner = shared.inner.lock().await;
            let (session_id, _) = Self::active_session(&inner)?;
            self.check_owned(&inner, &entity_id)?;
            session_id
        };

        // The entry stays registered until peers have been told.
        let topic = shared.topics.entities(&session_id);
        if let Err(e) = self
            .publish(&topic, SessionMessage::EntityRemove { entity_id }, false)
            .await
        {
            warn!("Failed to withdraw entity {}: {}", entity_id, e);
            return Err(e);
        }
        shared.inner.lock().await.registry.remove(&entity_id);
        debug!("Stopped synchronizing entity {}", entity_id);
        self.emit(Some(session_id), vec![SessionEvent::EntityRemoved(entity_id)]);
        Ok(())
    }

    /// Publishes the current transform of an entity this client owns.
    pub async fn update_synchronized_entity(&self, entity_id: EntityId) -> SyncResult<()> {
        let shared = &self.shared;
        let _op = shared.op_lock.lock().await;

        let (session_id, transform) = {
            let inner = shared.inner.lock().await;
            let (session_id, offset) = Self::active_session(&inner)?;
            self.check_owned(&inner, &entity_id)?;
            let transform = shared
                .entity_model
                .find_entity(&entity_id)
                .and_then(|h| shared.entity_model.transform(h))
                .ok_or(SyncError::UnknownEntity(entity_id))?;
            (session_id, transform.to_session_space(offset))
        };

        let topic = shared.topics.entities(&session_id);
        self.publish(
            &topic,
            SessionMessage::EntityUpdate {
                entity_id,
                transform,
            },
            false,
        )
        .await
    }

    // ── Messaging ────────────────────────────────────────────────

    /// Publishes an application message to the session.
    ///
    /// Returns `false` (and publishes nothing) when not connected or not in
    /// an active session. Delivery is fire-and-forget.
    pub async fn send_message(&self, topic: &str, message: &str) -> bool {
        let shared = &self.shared;
        if !shared.channel.is_connected() {
            warn!("Cannot send message on {}: not connected", topic);
            return false;
        }
        let _op = shared.op_lock.lock().await;

        let session_id = {
            let inner = shared.inner.lock().await;
            match Self::active_session(&inner) {
                Ok((id, _)) => id,
                Err(e) => {
                    warn!("Cannot send message on {}: {}", topic, e);
                    return false;
                }
            }
        };
        let scoped = match shared.topics.message(&session_id, topic) {
            Ok(scoped) => scoped,
            Err(e) => {
                warn!("Cannot send message: {}", e);
                return false;
            }
        };
        let message = SessionMessage::App {
            topic: topic.to_string(),
            payload: message.to_string(),
        };
        match self.publish(&scoped, message, false).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send message on {}: {}", topic, e);
                false
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers events to the registered handlers. Never call with `inner`
    /// locked.
    fn emit(&self, session: Option<SessionId>, events: Vec<SessionEvent>) {
        if events.is_empty() {
            return;
        }
        let handlers = self.listeners().handlers();
        for event in &events {
            for handler in &handlers {
                dispatch(handler.as_ref(), session, event);
            }
        }
    }

    fn start_event_loop(&self) {
        if self.shared.event_loop_started.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.shared.channel.take_events() {
            Some(events) => {
                tokio::spawn(inbound::run(Arc::downgrade(&self.shared), events));
            }
            None => warn!(
                "Event queue of channel to {} already taken, inbound traffic is ignored",
                self.shared.connection.endpoint
            ),
        }
    }

    fn connect_options(&self) -> SyncResult<ConnectOptions> {
        let shared = &self.shared;
        let last_will = match shared.connection.session_id {
            Some(session_id) => {
                let message = SessionMessage::ClientLeft {
                    client_id: shared.identity.client_id.clone(),
                    graceful: false,
                };
                Some(LastWill {
                    topic: shared.topics.control(&session_id),
                    payload: Envelope::new(shared.identity.client_id.clone(), message).encode()?,
                    qos: shared.config.qos,
                    retain: false,
                })
            }
            None => None,
        };
        Ok(ConnectOptions {
            endpoint: shared.connection.endpoint.clone(),
            transport: shared.connection.transport,
            tls: shared.connection.tls,
            client_id: shared.identity.client_id.clone(),
            client_token: shared.identity.client_token.clone(),
            keep_alive_secs: shared.config.keep_alive_secs,
            last_will,
        })
    }

    fn warn_if_will_mismatch(&self, session_id: &SessionId) {
        if let Some(bound) = self.shared.connection.session_id {
            if &bound != session_id {
                warn!(
                    "Hosting session {} on a connection whose last will targets {}",
                    session_id, bound
                );
            }
        }
    }

    fn check_can_host(state: SynchronizerState) -> SyncResult<()> {
        match state {
            SynchronizerState::Connected => Ok(()),
            SynchronizerState::Disconnected | SynchronizerState::Connecting => {
                Err(SyncError::NotConnected)
            }
            other => Err(SyncError::InvalidState(format!(
                "cannot host a session while {}",
                other
            ))),
        }
    }

    fn active_session(inner: &Inner) -> SyncResult<(SessionId, Vector3)> {
        match (&inner.session, inner.state) {
            (Some(session), SynchronizerState::SessionActive(_)) => {
                Ok((session.id, session.world_offset))
            }
            _ => Err(SyncError::InvalidState(format!(
                "no active session ({})",
                inner.state
            ))),
        }
    }

    fn check_owned(&self, inner: &Inner, entity_id: &EntityId) -> SyncResult<()> {
        let entity = inner
            .registry
            .get(entity_id)
            .ok_or(SyncError::UnknownEntity(*entity_id))?;
        if entity.owner != self.shared.identity.client_id {
            return Err(SyncError::InvalidState(format!(
                "entity {} is owned by {}",
                entity_id, entity.owner
            )));
        }
        Ok(())
    }

    /// Builds an announcement with the entity's current transform.
    fn announcement(&self, entity: &SynchronizedEntity, offset: Vector3) -> EntityAnnouncement {
        let model = &self.shared.entity_model;
        let transform = model
            .find_entity(&entity.entity_id)
            .and_then(|h| model.transform(h))
            .unwrap_or_default();
        EntityAnnouncement::new(entity, transform.to_session_space(offset))
    }

    async fn publish(&self, topic: &str, message: SessionMessage, retain: bool) -> SyncResult<()> {
        let kind = message.kind();
        let payload = Envelope::new(self.shared.identity.client_id.clone(), message).encode()?;
        self.shared
            .channel
            .publish(topic, payload, self.shared.config.qos, retain)
            .await?;
        debug!("Published {} on {}", kind, topic);
        Ok(())
    }

    async fn subscribe_session(&self, session_id: &SessionId) -> SyncResult<()> {
        let shared = &self.shared;
        for filter in shared
            .topics
            .subscriptions(session_id, &shared.identity.client_id)
        {
            shared.channel.subscribe(&filter).await?;
        }
        Ok(())
    }

    /// Announces a graceful departure and drops the subscriptions.
    async fn withdraw(&self, session_id: &SessionId) {
        let shared = &self.shared;
        if !shared.channel.is_connected() {
            return;
        }
        let left = SessionMessage::ClientLeft {
            client_id: shared.identity.client_id.clone(),
            graceful: true,
        };
        if let Err(e) = self
            .publish(&shared.topics.control(session_id), left, false)
            .await
        {
            debug!("Could not announce departure from {}: {}", session_id, e);
        }
        for filter in shared
            .topics
            .subscriptions(session_id, &shared.identity.client_id)
        {
            if let Err(e) = shared.channel.unsubscribe(&filter).await {
                debug!("Could not unsubscribe from {}: {}", filter, e);
            }
        }
    }

    fn state_after_session(&self) -> SynchronizerState {
        if self.shared.channel.is_connected() {
            SynchronizerState::Connected
        } else {
            SynchronizerState::Disconnected
        }
    }

    /// Leaves the hosted session, publishing removals for owned
    /// delete-with-client entities first. Caller holds the op lock.
    async fn leave_session(&self, destroy: bool) {
        let shared = &self.shared;
        let me = shared.identity.client_id.clone();

        let mut events = Vec::new();
        let (session, removals) = {
            let mut inner = shared.inner.lock().await;
            let removals: Vec<EntityId> = inner
                .registry
                .owned_by(&me)
                .into_iter()
                .filter(|e| e.delete_with_client)
                .map(|e| e.entity_id)
                .collect();
            let Some(session) = inner.clear_session() else {
                debug!("No session to leave");
                return;
            };
            let next = self.state_after_session();
            inner.set_state(next, &mut events);
            (session, removals)
        };

        let session_id = session.id;
        if shared.channel.is_connected() {
            let entities = shared.topics.entities(&session_id);
            for entity_id in removals {
                if let Err(e) = self
                    .publish(&entities, SessionMessage::EntityRemove { entity_id }, false)
                    .await
                {
                    warn!("Failed to publish removal of {}: {}", entity_id, e);
                }
            }
            if destroy {
                let closed = SessionMessage::SessionClosed { session_id };
                if let Err(e) = self
                    .publish(&shared.topics.control(&session_id), closed, false)
                    .await
                {
                    warn!("Failed to announce teardown of {}: {}", session_id, e);
                }
                let info = shared.topics.info(&session_id);
                if let Err(e) = shared
                    .channel
                    .publish(&info, Vec::new(), shared.config.qos, true)
                    .await
                {
                    debug!("Could not clear session info of {}: {}", session_id, e);
                }
            }
            self.withdraw(&session_id).await;
        }

        self.emit(Some(session_id), events);
        if destroy {
            info!("Destroyed session {}", session_id);
        } else {
            info!("Left session {}", session_id);
        }
    }

    /// Rolls back a session whose setup failed, unless it was already
    /// replaced.
    async fn abandon_session(&self, epoch: u64) {
        let mut events = Vec::new();
        let session_id = {
            let mut inner = self.shared.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            let session_id = inner.clear_session().map(|s| s.id);
            let next = self.state_after_session();
            inner.set_state(next, &mut events);
            session_id
        };
        if let Some(session_id) = session_id {
            self.withdraw(&session_id).await;
        }
        self.emit(session_id, events);
    }

    fn spawn_join_timeout(&self, request_id: Uuid) {
        let weak = Arc::downgrade(&self.shared);
        let timeout = Duration::from_millis(self.shared.config.join_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                Synchronizer { shared }.expire_join(request_id).await;
            }
        });
    }

    async fn expire_join(&self, request_id: Uuid) {
        let _op = self.shared.op_lock.lock().await;
        let mut events = Vec::new();
        let (pending, session_id) = {
            let mut inner = self.shared.inner.lock().await;
            if !matches!(&inner.pending_join, Some(p) if p.request_id == request_id) {
                return;
            }
            let pending = inner.pending_join.take();
            let session_id = inner.clear_session().map(|s| s.id);
            let next = self.state_after_session();
            inner.set_state(next, &mut events);
            (pending, session_id)
        };
        if let Some(session_id) = session_id {
            warn!("Join of session {} timed out", session_id);
            self.withdraw(&session_id).await;
        }
        self.emit(session_id, events);
        if let Some(pending) = pending {
            (pending.callback)(Err(SyncError::Timeout));
        }
    }

    fn spawn_state_timeout(&self, request_id: Uuid) {
        let weak = Arc::downgrade(&self.shared);
        let timeout = Duration::from_millis(self.shared.config.join_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let callback = shared.inner.lock().await.pending_state.remove(&request_id);
            if let Some(callback) = callback {
                debug!("State request {} timed out", request_id);
                callback(Err(SyncError::Timeout));
            }
        });
    }

    fn spawn_reannounce(&self, epoch: u64) {
        let Some(interval) = self
            .shared
            .config
            .reannounce_interval_ms
            .filter(|ms| *ms > 0)
        else {
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if !(Synchronizer { shared }).reannounce(epoch).await {
                    break;
                }
            }
        });
    }

    /// Re-publishes every locally owned entity. Returns `false` once the
    /// session of `epoch` is gone.
    async fn reannounce(&self, epoch: u64) -> bool {
        let shared = &self.shared;
        let _op = shared.op_lock.lock().await;
        let (session_id, announcements) = {
            let inner = shared.inner.lock().await;
            if inner.epoch != epoch {
                return false;
            }
            let Ok((session_id, offset)) = Self::active_session(&inner) else {
                return false;
            };
            let announcements: Vec<EntityAnnouncement> = inner
                .registry
                .owned_by(&shared.identity.client_id)
                .iter()
                .map(|entity| self.announcement(entity, offset))
                .collect();
            (session_id, announcements)
        };
        let topic = shared.topics.entities(&session_id);
        for announcement in announcements {
            let entity_id = announcement.entity_id;
            if let Err(e) = self
                .publish(&topic, SessionMessage::EntityAnnounce(announcement), false)
                .await
            {
                debug!("Re-announcement of {} failed: {}", entity_id, e);
            }
        }
        true
    }
}
