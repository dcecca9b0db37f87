//! Synchronization manager.
//!
//! The manager is the application's entry point: it builds synchronizers,
//! connects them, creates or joins their sessions, and keeps the mapping
//! from session ID to synchronizer. Every session ID maps to at most one
//! synchronizer, and at most one lifecycle operation per session ID is in
//! flight at a time. The manager does no network I/O of its own.

use crate::entity_model::EntityModel;
use crate::error::{SyncError, SyncResult};
use crate::events::{JoinCallback, JoinedSession, SessionEventHandler};
use crate::identity::ClientIdentity;
use crate::synchronizer::{
    Synchronizer, SynchronizerConfig, SynchronizerConnection, WeakSynchronizer,
};
use crate::transport::ChannelFactory;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};
use worldsync_types::{ClientId, Endpoint, SessionId, TransportKind, Vector3};

/// Configuration for a [`SynchronizationManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Configuration handed to every synchronizer the manager builds.
    pub synchronizer: SynchronizerConfig,
    /// Exit and deregister a session when a peer destroys it.
    pub exit_on_remote_destroy: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            synchronizer: SynchronizerConfig::default(),
            exit_on_remote_destroy: true,
        }
    }
}

/// Everything needed to create or join one session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub endpoint: Endpoint,
    pub tls: bool,
    pub transport: TransportKind,
    pub session_id: SessionId,
    /// Session tag when creating. Joiners adopt the creator's tag.
    pub session_tag: String,
    pub world_offset: Vector3,
    pub identity: ClientIdentity,
}

impl SessionParams {
    pub fn new(endpoint: Endpoint, transport: TransportKind, session_id: SessionId) -> Self {
        Self {
            endpoint,
            tls: false,
            transport,
            session_id,
            session_tag: String::new(),
            world_offset: Vector3::ZERO,
            identity: ClientIdentity::default(),
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_session_tag(mut self, tag: impl Into<String>) -> Self {
        self.session_tag = tag.into();
        self
    }

    pub fn with_world_offset(mut self, world_offset: Vector3) -> Self {
        self.world_offset = world_offset;
        self
    }

    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = identity;
        self
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Registry {
    synchronizers: RwLock<HashMap<SessionId, Synchronizer>>,
    in_flight: Mutex<HashSet<SessionId>>,
}

impl Registry {
    /// Marks a lifecycle operation on `session_id` as in flight.
    fn begin(self: &Arc<Self>, session_id: SessionId) -> SyncResult<LifecycleGuard> {
        if !lock(&self.in_flight).insert(session_id) {
            return Err(SyncError::SessionBusy(session_id));
        }
        Ok(LifecycleGuard {
            registry: Arc::clone(self),
            session_id,
        })
    }

    fn get(&self, session_id: &SessionId) -> Option<Synchronizer> {
        read(&self.synchronizers).get(session_id).cloned()
    }

    fn insert(&self, session_id: SessionId, synchronizer: Synchronizer) {
        write(&self.synchronizers).insert(session_id, synchronizer);
    }

    fn remove(&self, session_id: &SessionId) -> Option<Synchronizer> {
        write(&self.synchronizers).remove(session_id)
    }

    /// Removes the entry for `session_id` only if it is `synchronizer`.
    fn remove_if(&self, session_id: &SessionId, synchronizer: &Synchronizer) -> bool {
        let mut map = write(&self.synchronizers);
        if map.get(session_id).is_some_and(|s| s.ptr_eq(synchronizer)) {
            map.remove(session_id);
            true
        } else {
            false
        }
    }
}

/// Clears the in-flight mark when the lifecycle operation ends.
struct LifecycleGuard {
    registry: Arc<Registry>,
    session_id: SessionId,
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        lock(&self.registry.in_flight).remove(&self.session_id);
    }
}

/// Exits a session a peer destroyed and drops it from the registry.
struct RemoteTeardown {
    registry: Weak<Registry>,
    synchronizer: WeakSynchronizer,
}

impl SessionEventHandler for RemoteTeardown {
    fn on_session_destroyed(&self, session: SessionId, by: &ClientId) {
        let registry = self.registry.clone();
        let synchronizer = self.synchronizer.clone();
        let by = by.clone();
        tokio::spawn(async move {
            let (Some(registry), Some(synchronizer)) = (registry.upgrade(), synchronizer.upgrade())
            else {
                return;
            };
            let Ok(_guard) = registry.begin(session) else {
                debug!("Session {} busy, skipping remote teardown", session);
                return;
            };
            if !registry.remove_if(&session, &synchronizer) {
                return;
            }
            info!("Session {} destroyed by {}, exiting", session, by);
            if let Err(e) = synchronizer.exit_session().await {
                warn!("Failed to exit session {}: {}", session, e);
            }
            if let Err(e) = synchronizer.disconnect().await {
                warn!("Failed to disconnect from {}: {}", synchronizer.endpoint(), e);
            }
        });
    }
}

/// Maps sessions to the synchronizers hosting them.
pub struct SynchronizationManager {
    factory: Arc<dyn ChannelFactory>,
    entity_model: Arc<dyn EntityModel>,
    config: ManagerConfig,
    registry: Arc<Registry>,
    handlers: Mutex<Vec<Arc<dyn SessionEventHandler>>>,
}

impl SynchronizationManager {
    pub fn new(factory: Arc<dyn ChannelFactory>, entity_model: Arc<dyn EntityModel>) -> Self {
        Self::with_config(factory, entity_model, ManagerConfig::default())
    }

    pub fn with_config(
        factory: Arc<dyn ChannelFactory>,
        entity_model: Arc<dyn EntityModel>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            factory,
            entity_model,
            config,
            registry: Arc::new(Registry::default()),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Attaches a handler to every current and future synchronizer.
    pub fn add_event_handler(&self, handler: Arc<dyn SessionEventHandler>) {
        for synchronizer in read(&self.registry.synchronizers).values() {
            synchronizer.add_event_handler(handler.clone());
        }
        lock(&self.handlers).push(handler);
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Builds a synchronizer, connects it and creates a session.
    ///
    /// Nothing is registered if any step fails.
    pub async fn add_synchronizer_and_session(
        &self,
        params: SessionParams,
    ) -> SyncResult<(Synchronizer, SessionId)> {
        let session_id = params.session_id;
        let _guard = self.begin_new(session_id)?;
        let synchronizer = self.build(&params)?;

        if let Err(e) = synchronizer.connect().await {
            warn!("Cannot create session {}: {}", session_id, e);
            return Err(e);
        }
        if let Err(e) = synchronizer
            .create_session(session_id, params.session_tag.clone(), params.world_offset)
            .await
        {
            warn!("Cannot create session {}: {}", session_id, e);
            self.close(&synchronizer).await;
            return Err(e);
        }

        self.registry.insert(session_id, synchronizer.clone());
        info!(
            "Registered session {} at {}",
            session_id, params.endpoint
        );
        Ok((synchronizer, session_id))
    }

    /// Builds a synchronizer, connects it and joins a session.
    ///
    /// The synchronizer is registered right away, so it can be looked up
    /// while the join is in flight. `on_joined` fires exactly once if this
    /// returns `Ok`; if the join then fails, the synchronizer is
    /// deregistered and disconnected before `on_joined` sees the error.
    pub async fn add_synchronizer_and_join_session(
        &self,
        params: SessionParams,
        on_joined: JoinCallback,
    ) -> SyncResult<(Synchronizer, SessionId, ClientId)> {
        let session_id = params.session_id;
        let _guard = self.begin_new(session_id)?;
        let synchronizer = self.build(&params)?;

        if let Err(e) = synchronizer.connect().await {
            warn!("Cannot join session {}: {}", session_id, e);
            return Err(e);
        }

        self.registry.insert(session_id, synchronizer.clone());
        let registry = Arc::downgrade(&self.registry);
        let weak = synchronizer.downgrade();
        let wrapped: JoinCallback = Box::new(move |result: SyncResult<JoinedSession>| {
            if let Err(e) = &result {
                warn!("Join of session {} failed: {}", session_id, e);
                if let (Some(registry), Some(synchronizer)) = (registry.upgrade(), weak.upgrade()) {
                    registry.remove_if(&session_id, &synchronizer);
                    tokio::spawn(async move {
                        if let Err(e) = synchronizer.disconnect().await {
                            debug!("Disconnect after failed join: {}", e);
                        }
                    });
                }
            }
            on_joined(result);
        });

        if let Err(e) = synchronizer
            .join_session(session_id, params.world_offset, wrapped)
            .await
        {
            warn!("Cannot join session {}: {}", session_id, e);
            self.registry.remove_if(&session_id, &synchronizer);
            self.close(&synchronizer).await;
            return Err(e);
        }

        let client_id = synchronizer.local_client_id().clone();
        info!("Joining session {} at {} as {}", session_id, params.endpoint, client_id);
        Ok((synchronizer, session_id, client_id))
    }

    /// Destroys a session for every member and drops its synchronizer.
    pub async fn destroy_session(&self, session_id: &SessionId) -> SyncResult<()> {
        let _guard = self.registry.begin(*session_id)?;
        let synchronizer = self.take(session_id)?;
        let result = synchronizer.destroy_session().await;
        self.close(&synchronizer).await;
        result
    }

    /// Leaves a session and drops its synchronizer.
    pub async fn exit_session(&self, session_id: &SessionId) -> SyncResult<()> {
        let _guard = self.registry.begin(*session_id)?;
        let synchronizer = self.take(session_id)?;
        let result = synchronizer.exit_session().await;
        self.close(&synchronizer).await;
        result
    }

    /// Disconnects and drops every synchronizer of an endpoint. Returns how
    /// many were closed. Sessions with a lifecycle operation in flight are
    /// skipped.
    pub async fn disconnect_endpoint(&self, host: &str, port: u16) -> usize {
        let mut closed = 0;
        for synchronizer in self.get_synchronizers(host, port) {
            let Some(session_id) = self.session_of(&synchronizer) else {
                continue;
            };
            let Ok(_guard) = self.registry.begin(session_id) else {
                warn!("Session {} busy, not disconnecting it", session_id);
                continue;
            };
            if self.registry.remove_if(&session_id, &synchronizer) {
                self.close(&synchronizer).await;
                closed += 1;
            }
        }
        info!("Disconnected {} synchronizer(s) from {}:{}", closed, host, port);
        closed
    }

    /// Disconnects and drops every synchronizer.
    pub async fn shutdown(&self) {
        let all: Vec<Synchronizer> = write(&self.registry.synchronizers)
            .drain()
            .map(|(_, s)| s)
            .collect();
        for synchronizer in all {
            self.close(&synchronizer).await;
        }
    }

    // ── Lookup ───────────────────────────────────────────────────

    pub fn get_synchronizer_for_session(&self, session_id: &SessionId) -> Option<Synchronizer> {
        self.registry.get(session_id)
    }

    /// Synchronizers connected to `host:port`.
    pub fn get_synchronizers(&self, host: &str, port: u16) -> Vec<Synchronizer> {
        read(&self.registry.synchronizers)
            .values()
            .filter(|s| s.endpoint().matches(host, port))
            .cloned()
            .collect()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = read(&self.registry.synchronizers).keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        read(&self.registry.synchronizers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Internals ────────────────────────────────────────────────

    fn begin_new(&self, session_id: SessionId) -> SyncResult<LifecycleGuard> {
        let guard = self.registry.begin(session_id)?;
        if self.registry.get(&session_id).is_some() {
            warn!("Session {} already has a synchronizer", session_id);
            return Err(SyncError::SessionExists(session_id));
        }
        Ok(guard)
    }

    fn take(&self, session_id: &SessionId) -> SyncResult<Synchronizer> {
        self.registry.remove(session_id).ok_or_else(|| {
            warn!("No synchronizer for session {}", session_id);
            SyncError::UnknownSession(*session_id)
        })
    }

    fn session_of(&self, synchronizer: &Synchronizer) -> Option<SessionId> {
        read(&self.registry.synchronizers)
            .iter()
            .find(|(_, s)| s.ptr_eq(synchronizer))
            .map(|(id, _)| *id)
    }

    fn build(&self, params: &SessionParams) -> SyncResult<Synchronizer> {
        let connection =
            SynchronizerConnection::new(params.endpoint.clone(), params.transport, params.tls)
                .for_session(params.session_id);
        let channel = self
            .factory
            .create_channel(&params.endpoint, params.transport, params.tls)?;
        let synchronizer = Synchronizer::new(
            connection,
            &params.identity,
            channel,
            self.entity_model.clone(),
            self.config.synchronizer.clone(),
        )?;
        for handler in lock(&self.handlers).iter() {
            synchronizer.add_event_handler(handler.clone());
        }
        if self.config.exit_on_remote_destroy {
            synchronizer.add_event_handler(Arc::new(RemoteTeardown {
                registry: Arc::downgrade(&self.registry),
                synchronizer: synchronizer.downgrade(),
            }));
        }
        Ok(synchronizer)
    }

    async fn close(&self, synchronizer: &Synchronizer) {
        if let Err(e) = synchronizer.disconnect().await {
            warn!("Failed to disconnect from {}: {}", synchronizer.endpoint(), e);
        }
    }
}
