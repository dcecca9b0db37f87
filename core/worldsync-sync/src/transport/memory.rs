//! In-process broker and channels.
//!
//! [`MemoryBroker`] routes publishes between [`MemoryChannel`]s in the same
//! process with the semantics synchronizers rely on from a real broker:
//! wildcard subscriptions, retained messages, last will on connection loss,
//! per-client session takeover, and per-subscriber ordering. It also keeps a
//! bounded log of recent publishes for inspection.

use super::{
    ChannelEvent, ChannelFactory, ChannelState, ConnectOptions, LastWill, MessageChannel, QoS,
};
use crate::error::{SyncError, SyncResult};
use crate::topics::topic_matches;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use worldsync_types::{ClientId, Endpoint, TransportKind};

/// Publishes kept in a broker's log unless configured otherwise.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Moves a connection to `new`, emitting a state change if it differs.
fn transition(
    state: &Mutex<ChannelState>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    new: ChannelState,
) {
    let old = std::mem::replace(&mut *lock(state), new);
    if old != new {
        let _ = events.send(ChannelEvent::StateChanged { old, new });
    }
}

/// A publish as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    /// Client the message was published by (or on behalf of, for a last will).
    pub publisher: ClientId,
}

struct Slot {
    client_id: ClientId,
    filters: Vec<String>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: Arc<Mutex<ChannelState>>,
    last_will: Option<LastWill>,
}

struct BrokerState {
    endpoint: Endpoint,
    transports: Vec<TransportKind>,
    credentials: HashMap<String, String>,
    slots: HashMap<u64, Slot>,
    retained: BTreeMap<String, Vec<u8>>,
    denied: Vec<String>,
    log: VecDeque<PublishedMessage>,
    log_capacity: usize,
    next_conn: u64,
}

impl BrokerState {
    fn route(&mut self, message: PublishedMessage) {
        if message.retain {
            if message.payload.is_empty() {
                self.retained.remove(&message.topic);
            } else {
                self.retained
                    .insert(message.topic.clone(), message.payload.clone());
            }
        }
        for slot in self.slots.values() {
            if slot.filters.iter().any(|f| topic_matches(f, &message.topic)) {
                let _ = slot.events.send(ChannelEvent::Message {
                    topic: message.topic.clone(),
                    payload: message.payload.clone(),
                });
            }
        }
        if self.log_capacity == 0 {
            return;
        }
        if self.log.len() == self.log_capacity {
            self.log.pop_front();
        }
        self.log.push_back(message);
    }

    /// Removes a connection. A lost connection publishes its last will.
    fn drop_slot(&mut self, conn: u64, lost: bool, reason: Option<&str>) -> bool {
        let Some(slot) = self.slots.remove(&conn) else {
            return false;
        };
        if let Some(reason) = reason {
            let _ = slot.events.send(ChannelEvent::Error(reason.to_string()));
        }
        transition(&slot.state, &slot.events, ChannelState::Disconnected);
        if lost {
            if let Some(will) = slot.last_will {
                debug!("Publishing last will of {} on {}", slot.client_id, will.topic);
                self.route(PublishedMessage {
                    topic: will.topic,
                    payload: will.payload,
                    qos: will.qos,
                    retain: will.retain,
                    publisher: slot.client_id,
                });
            }
        }
        true
    }

    fn slot_for(&self, client_id: &ClientId) -> Option<u64> {
        self.slots
            .iter()
            .find(|(_, slot)| &slot.client_id == client_id)
            .map(|(conn, _)| *conn)
    }
}

/// An in-process pub/sub broker. Cloning yields another handle to the same
/// broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Endpoint::new("localhost", 1883))
    }
}

impl MemoryBroker {
    /// Creates a broker that accepts every transport kind and any client.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                endpoint,
                transports: vec![TransportKind::Tcp, TransportKind::WebSocket],
                credentials: HashMap::new(),
                slots: HashMap::new(),
                retained: BTreeMap::new(),
                denied: Vec::new(),
                log: VecDeque::new(),
                log_capacity: DEFAULT_LOG_CAPACITY,
                next_conn: 0,
            })),
        }
    }

    /// Restricts the transport kinds the broker accepts.
    pub fn with_transports(self, transports: &[TransportKind]) -> Self {
        lock(&self.state).transports = transports.to_vec();
        self
    }

    /// Requires `client_id` to present `token` when connecting.
    pub fn with_credentials(self, client_id: impl Into<String>, token: impl Into<String>) -> Self {
        lock(&self.state)
            .credentials
            .insert(client_id.into(), token.into());
        self
    }

    /// Keeps at most `capacity` publishes in the log, dropping the oldest
    /// first. Zero disables the log.
    pub fn with_log_capacity(self, capacity: usize) -> Self {
        {
            let mut state = lock(&self.state);
            state.log_capacity = capacity;
            while state.log.len() > capacity {
                state.log.pop_front();
            }
        }
        self
    }

    /// Refuses publishes on topics matching `filter` until allowed again.
    pub fn deny_publish(&self, filter: impl Into<String>) {
        let filter = filter.into();
        let mut state = lock(&self.state);
        if !state.denied.contains(&filter) {
            state.denied.push(filter);
        }
    }

    pub fn allow_publish(&self, filter: &str) {
        lock(&self.state).denied.retain(|f| f != filter);
    }

    pub fn endpoint(&self) -> Endpoint {
        lock(&self.state).endpoint.clone()
    }

    /// Creates an unconnected channel to this broker.
    pub fn channel(&self) -> MemoryChannel {
        MemoryChannel::new(Some(self.clone()), self.endpoint())
    }

    /// Logged publishes, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).log.iter().cloned().collect()
    }

    /// Publishes whose topic matches `filter`.
    pub fn published_matching(&self, filter: &str) -> Vec<PublishedMessage> {
        lock(&self.state)
            .log
            .iter()
            .filter(|m| topic_matches(filter, &m.topic))
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        lock(&self.state).log.clear();
    }

    /// The retained payload of `topic`, if any.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        lock(&self.state).retained.get(topic).cloned()
    }

    /// Clients currently connected, sorted.
    pub fn connected_clients(&self) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = lock(&self.state)
            .slots
            .values()
            .map(|s| s.client_id.clone())
            .collect();
        clients.sort();
        clients
    }

    /// Number of connections with at least one filter matching `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.state)
            .slots
            .values()
            .filter(|s| s.filters.iter().any(|f| topic_matches(f, topic)))
            .count()
    }

    /// Drops a client's connection from the broker side. With `lost`, the
    /// client's last will is published.
    pub fn disconnect_client(&self, client_id: &ClientId, lost: bool) -> bool {
        let mut state = lock(&self.state);
        match state.slot_for(client_id) {
            Some(conn) => {
                let reason = lost.then_some("connection lost");
                state.drop_slot(conn, lost, reason)
            }
            None => false,
        }
    }

    fn attach(
        &self,
        options: &ConnectOptions,
        events: mpsc::UnboundedSender<ChannelEvent>,
        channel_state: Arc<Mutex<ChannelState>>,
    ) -> SyncResult<u64> {
        let mut state = lock(&self.state);
        if !state.transports.contains(&options.transport) {
            return Err(SyncError::UnsupportedTransport(options.transport));
        }
        if let Some(expected) = state.credentials.get(options.client_id.as_str()) {
            if options.client_token.as_deref() != Some(expected.as_str()) {
                return Err(SyncError::Network(format!(
                    "not authorized: {}",
                    options.client_id
                )));
            }
        }
        if let Some(existing) = state.slot_for(&options.client_id) {
            info!("Client {} reconnected, taking over session", options.client_id);
            state.drop_slot(existing, false, Some("session taken over"));
        }

        state.next_conn += 1;
        let conn = state.next_conn;
        state.slots.insert(
            conn,
            Slot {
                client_id: options.client_id.clone(),
                filters: Vec::new(),
                events,
                state: channel_state,
                last_will: options.last_will.clone(),
            },
        );
        Ok(conn)
    }

    fn detach(&self, conn: u64, lost: bool) {
        let reason = lost.then_some("connection lost");
        lock(&self.state).drop_slot(conn, lost, reason);
    }

    fn publish_from(
        &self,
        conn: u64,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> SyncResult<()> {
        let mut state = lock(&self.state);
        let publisher = state
            .slots
            .get(&conn)
            .map(|s| s.client_id.clone())
            .ok_or(SyncError::NotConnected)?;
        if state.denied.iter().any(|f| topic_matches(f, topic)) {
            return Err(SyncError::Network(format!(
                "{publisher} not authorized to publish on {topic}"
            )));
        }
        state.route(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            publisher,
        });
        Ok(())
    }

    fn subscribe(&self, conn: u64, filter: &str) -> SyncResult<()> {
        let mut state = lock(&self.state);
        let retained: Vec<(String, Vec<u8>)> = state
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(t, p)| (t.clone(), p.clone()))
            .collect();
        let slot = state.slots.get_mut(&conn).ok_or(SyncError::NotConnected)?;
        if !slot.filters.iter().any(|f| f == filter) {
            slot.filters.push(filter.to_string());
        }
        for (topic, payload) in retained {
            let _ = slot.events.send(ChannelEvent::Message { topic, payload });
        }
        Ok(())
    }

    fn unsubscribe(&self, conn: u64, filter: &str) -> SyncResult<()> {
        let mut state = lock(&self.state);
        let slot = state.slots.get_mut(&conn).ok_or(SyncError::NotConnected)?;
        slot.filters.retain(|f| f != filter);
        Ok(())
    }
}

impl ChannelFactory for MemoryBroker {
    fn create_channel(
        &self,
        endpoint: &Endpoint,
        _transport: TransportKind,
        _tls: bool,
    ) -> SyncResult<Arc<dyn MessageChannel>> {
        Ok(Arc::new(MemoryChannel::new(
            Some(self.clone()),
            endpoint.clone(),
        )))
    }
}

/// A set of in-process brokers addressed by endpoint.
///
/// Channels created for an endpoint without a broker fail to connect.
#[derive(Default)]
pub struct MemoryNetwork {
    brokers: Mutex<HashMap<Endpoint, MemoryBroker>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a broker at `endpoint`, or returns the one already there.
    pub fn add_broker(&self, endpoint: Endpoint) -> MemoryBroker {
        lock(&self.brokers)
            .entry(endpoint.clone())
            .or_insert_with(|| MemoryBroker::new(endpoint))
            .clone()
    }

    /// Registers a pre-configured broker at its endpoint.
    pub fn insert_broker(&self, broker: MemoryBroker) {
        lock(&self.brokers).insert(broker.endpoint(), broker);
    }

    pub fn broker(&self, endpoint: &Endpoint) -> Option<MemoryBroker> {
        lock(&self.brokers).get(endpoint).cloned()
    }
}

impl ChannelFactory for MemoryNetwork {
    fn create_channel(
        &self,
        endpoint: &Endpoint,
        _transport: TransportKind,
        _tls: bool,
    ) -> SyncResult<Arc<dyn MessageChannel>> {
        Ok(Arc::new(MemoryChannel::new(
            self.broker(endpoint),
            endpoint.clone(),
        )))
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryChannel {
    broker: Option<MemoryBroker>,
    endpoint: Endpoint,
    conn: Mutex<Option<u64>>,
    state: Arc<Mutex<ChannelState>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("endpoint", &self.endpoint)
            .field("conn", &*lock(&self.conn))
            .field("state", &*lock(&self.state))
            .finish()
    }
}

impl MemoryChannel {
    fn new(broker: Option<MemoryBroker>, endpoint: Endpoint) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            broker,
            endpoint,
            conn: Mutex::new(None),
            state: Arc::new(Mutex::new(ChannelState::Disconnected)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn live_conn(&self) -> SyncResult<(&MemoryBroker, u64)> {
        let broker = self.broker.as_ref().ok_or(SyncError::NotConnected)?;
        if *lock(&self.state) != ChannelState::Connected {
            return Err(SyncError::NotConnected);
        }
        let conn = (*lock(&self.conn)).ok_or(SyncError::NotConnected)?;
        Ok((broker, conn))
    }

    /// Simulates an abnormal connection loss: the broker publishes the
    /// last will and the channel reports an error.
    pub fn drop_connection(&self) {
        let conn = lock(&self.conn).take();
        if let (Some(broker), Some(conn)) = (&self.broker, conn) {
            warn!("Dropping connection to {}", self.endpoint);
            broker.detach(conn, true);
        }
        transition(&self.state, &self.events_tx, ChannelState::Disconnected);
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn connect(&self, options: ConnectOptions) -> SyncResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        transition(&self.state, &self.events_tx, ChannelState::Connecting);

        let attached = match &self.broker {
            Some(broker) => broker.attach(&options, self.events_tx.clone(), self.state.clone()),
            None => Err(SyncError::Network(format!(
                "connection refused: {}",
                self.endpoint
            ))),
        };

        match attached {
            Ok(conn) => {
                *lock(&self.conn) = Some(conn);
                transition(&self.state, &self.events_tx, ChannelState::Connected);
                debug!("{} connected to {}", options.client_id, self.endpoint);
                Ok(())
            }
            Err(e) => {
                let _ = self.events_tx.send(ChannelEvent::Error(e.to_string()));
                transition(&self.state, &self.events_tx, ChannelState::Disconnected);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> SyncResult<()> {
        let conn = lock(&self.conn).take();
        match (&self.broker, conn) {
            (Some(broker), Some(conn)) => {
                transition(&self.state, &self.events_tx, ChannelState::Disconnecting);
                broker.detach(conn, false);
            }
            _ => debug!("Channel to {} already disconnected", self.endpoint),
        }
        transition(&self.state, &self.events_tx, ChannelState::Disconnected);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> SyncResult<()> {
        let (broker, conn) = self.live_conn()?;
        broker.subscribe(conn, filter)
    }

    async fn unsubscribe(&self, filter: &str) -> SyncResult<()> {
        let (broker, conn) = self.live_conn()?;
        broker.unsubscribe(conn, filter)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> SyncResult<()> {
        if topic.contains(['+', '#']) {
            return Err(SyncError::Protocol(format!(
                "cannot publish to wildcard topic {topic:?}"
            )));
        }
        let (broker, conn) = self.live_conn()?;
        broker.publish_from(conn, topic, payload, qos, retain)
    }

    fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        lock(&self.events_rx).take()
    }
}
