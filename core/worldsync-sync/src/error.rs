//! Error types for the sync layer.

use thiserror::Error;
use worldsync_types::{EntityId, SessionId, TransportKind};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error reported by the message channel.
    #[error("network error: {0}")]
    Network(String),

    /// Protocol error (invalid or unexpected message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid identifier, transport name or client ID.
    #[error(transparent)]
    Types(#[from] worldsync_types::Error),

    /// The channel does not support the requested transport kind.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(TransportKind),

    /// The channel is not connected.
    #[error("not connected")]
    NotConnected,

    /// The operation is not valid in the synchronizer's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No synchronizer handles this session.
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// A synchronizer already handles this session.
    #[error("session already registered: {0}")]
    SessionExists(SessionId),

    /// Another lifecycle operation for this session is in flight.
    #[error("session busy: {0}")]
    SessionBusy(SessionId),

    /// The entity model does not know this entity, or it is not synchronized.
    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),

    /// The entity is already being synchronized.
    #[error("entity already synchronized: {0}")]
    EntityAlreadySynchronized(EntityId),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}
