//! Message channel abstraction.
//!
//! A message channel is one connection to a pub/sub broker. It knows nothing
//! about sessions: it connects, subscribes to topic filters, publishes
//! payloads, and reports inbound messages, state changes and errors as
//! [`ChannelEvent`]s on a queue the owner drains.

pub mod memory;

use crate::error::SyncResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use worldsync_types::{ClientId, Endpoint, TransportKind};

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Message the broker publishes on the client's behalf if the connection
/// is lost without a graceful disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Parameters of a broker connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub endpoint: Endpoint,
    pub transport: TransportKind,
    pub tls: bool,
    pub client_id: ClientId,
    pub client_token: Option<String>,
    pub keep_alive_secs: u16,
    pub last_will: Option<LastWill>,
}

/// Something that happened on a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// The connection state changed.
    StateChanged {
        old: ChannelState,
        new: ChannelState,
    },
    /// The transport reported an error.
    Error(String),
}

/// A connection to a pub/sub broker.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Opens the connection.
    async fn connect(&self, options: ConnectOptions) -> SyncResult<()>;

    /// Closes the connection gracefully (no last will is published).
    /// Closing a closed channel is not an error.
    async fn disconnect(&self) -> SyncResult<()>;

    /// Subscribes to a topic filter (`+` and `#` wildcards).
    async fn subscribe(&self, filter: &str) -> SyncResult<()>;

    /// Removes a subscription.
    async fn unsubscribe(&self, filter: &str) -> SyncResult<()>;

    /// Publishes a payload. With `retain`, the broker keeps the payload for
    /// future subscribers; an empty retained payload clears it.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool)
        -> SyncResult<()>;

    /// Returns the current connection state.
    fn state(&self) -> ChannelState;

    /// Returns whether the channel is connected.
    fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Hands out the event queue. Only the first call returns `Some`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;
}

/// Creates channels for synchronizers.
pub trait ChannelFactory: Send + Sync {
    /// Allocates a (not yet connected) channel for an endpoint.
    fn create_channel(
        &self,
        endpoint: &Endpoint,
        transport: TransportKind,
        tls: bool,
    ) -> SyncResult<Arc<dyn MessageChannel>>;
}
