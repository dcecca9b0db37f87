//! Shared test helpers for synchronizer tests.

#![allow(dead_code, unused_macros)]

use std::sync::{Arc, Mutex};
use worldsync_sync::entity_model::memory::MemoryEntityModel;
use worldsync_sync::{
    ClientIdentity, JoinedSession, Member, MemoryBroker, MemoryChannel, MessageChannel,
    SessionEvent, SessionEventHandler, SyncError, SyncResult, SynchronizedEntity, Synchronizer,
    SynchronizerConfig, SynchronizerConnection, SynchronizerState,
};
use worldsync_types::{ClientId, Endpoint, EntityId, SessionId, TransportKind, Vector3};

pub const SESSION: &str = "11111111-1111-1111-1111-111111111111";

/// Polls a condition (which may `.await`) until it holds, sleeping briefly
/// between tries. Evaluates to whether it ever held.
macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..400 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        held
    }};
}

/// Installs a test subscriber; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn session_id() -> SessionId {
    SessionId::parse(SESSION).unwrap()
}

pub fn test_endpoint() -> Endpoint {
    Endpoint::new("test", 1883)
}

pub fn test_broker() -> MemoryBroker {
    MemoryBroker::new(test_endpoint())
}

pub fn client(name: &str) -> ClientId {
    ClientId::new(name).unwrap()
}

/// Records every event a synchronizer emits.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: SessionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl SessionEventHandler for RecordingHandler {
    fn on_state_changed(
        &self,
        _session: Option<SessionId>,
        old: SynchronizerState,
        new: SynchronizerState,
    ) {
        self.push(SessionEvent::StateChanged { old, new });
    }

    fn on_member_joined(&self, _session: SessionId, member: &Member) {
        self.push(SessionEvent::MemberJoined(member.clone()));
    }

    fn on_member_left(&self, _session: SessionId, client_id: &ClientId, graceful: bool) {
        self.push(SessionEvent::MemberLeft {
            client_id: client_id.clone(),
            graceful,
        });
    }

    fn on_entity_added(&self, _session: SessionId, entity: &SynchronizedEntity) {
        self.push(SessionEvent::EntityAdded(entity.clone()));
    }

    fn on_entity_updated(&self, _session: SessionId, entity_id: EntityId) {
        self.push(SessionEvent::EntityUpdated(entity_id));
    }

    fn on_entity_removed(&self, _session: SessionId, entity_id: EntityId) {
        self.push(SessionEvent::EntityRemoved(entity_id));
    }

    fn on_session_destroyed(&self, _session: SessionId, by: &ClientId) {
        self.push(SessionEvent::SessionDestroyed { by: by.clone() });
    }

    fn on_error(&self, _session: Option<SessionId>, error: &str) {
        self.push(SessionEvent::Error(error.to_string()));
    }
}

/// A synchronizer with its own entity model, channel and event recorder.
pub struct Peer {
    pub sync: Synchronizer,
    pub model: Arc<MemoryEntityModel>,
    pub channel: Arc<MemoryChannel>,
    pub events: Arc<RecordingHandler>,
}

impl Peer {
    pub fn new(broker: &MemoryBroker, name: &str) -> Self {
        Self::with_config(broker, name, session_id(), SynchronizerConfig::default())
    }

    pub fn with_config(
        broker: &MemoryBroker,
        name: &str,
        session: SessionId,
        config: SynchronizerConfig,
    ) -> Self {
        let model = Arc::new(MemoryEntityModel::new());
        let channel = Arc::new(broker.channel());
        let connection = SynchronizerConnection::new(broker.endpoint(), TransportKind::Tcp, false)
            .for_session(session);
        let identity = ClientIdentity::anonymous(format!("{name} tag")).with_credentials(name, None);
        let dyn_channel: Arc<dyn MessageChannel> = channel.clone();
        let sync = Synchronizer::new(connection, &identity, dyn_channel, model.clone(), config)
            .unwrap();
        let events = Arc::new(RecordingHandler::default());
        sync.add_event_handler(events.clone());
        Self {
            sync,
            model,
            channel,
            events,
        }
    }

    pub fn id(&self) -> ClientId {
        self.sync.local_client_id().clone()
    }

    /// Connects and creates `session`.
    pub async fn create(&self, session: SessionId) {
        self.sync.connect().await.unwrap();
        self.sync
            .create_session(session, "lobby", Vector3::ZERO)
            .await
            .unwrap();
    }

    /// Connects and joins `session`, waiting for the join to complete.
    pub async fn join(&self, session: SessionId) -> SyncResult<JoinedSession> {
        self.sync.connect().await?;
        join(&self.sync, session, Vector3::ZERO).await
    }

    /// Spawns a local entity and starts synchronizing it.
    pub async fn share(&self, delete_with_client: bool) -> EntityId {
        let id = EntityId::new();
        self.model.spawn(id, Default::default());
        self.sync
            .add_synchronized_entity(id, delete_with_client, None)
            .await
            .unwrap();
        id
    }
}

/// Joins `session` and waits for the join callback.
pub async fn join(
    sync: &Synchronizer,
    session: SessionId,
    world_offset: Vector3,
) -> SyncResult<JoinedSession> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    sync.join_session(
        session,
        world_offset,
        Box::new(move |result: SyncResult<JoinedSession>| {
            let _ = tx.send(result);
        }),
    )
    .await?;
    rx.await.map_err(|_| SyncError::ChannelClosed)?
}
