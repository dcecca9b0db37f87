//! Core type definitions for worldsync.
//!
//! This crate defines the plain value types shared by every layer of the
//! world-synchronization stack:
//! - Session, entity and client identifiers
//! - Spatial values exchanged with peers (vectors, rotations, transforms)
//! - Broker endpoints and transport kinds
//!
//! Nothing here performs I/O.

mod endpoint;
mod ids;
mod math;

pub use endpoint::{Endpoint, TransportKind};
pub use ids::{ClientId, EntityId, SessionId, MAX_CLIENT_ID_LEN};
pub use math::{Quaternion, Transform, Vector3};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing or validating core types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid transport kind: {0:?}")]
    InvalidTransport(String),

    #[error("invalid client id: {0}")]
    InvalidClientId(String),
}
