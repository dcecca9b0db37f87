//! Multi-user world synchronization over a pub/sub broker.
//!
//! Several independently connected clients agree on the existence, state
//! and lifetime of a set of replicated entities in a shared 3-D scene. The
//! only communication primitive is a publish/subscribe message channel.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Transport**: [`MessageChannel`] over a broker, plus an in-process
//!   [`MemoryBroker`] implementation
//! - **Identity**: optional client ID/token and a display tag
//! - **Registry**: per-session table of synchronized entities
//! - **Session**: ID, tag, world offset and members
//! - **Synchronizer**: one channel, one session, the handshake state machine
//! - **Manager**: maps session IDs to synchronizers
//! - **Facade**: [`WorldSync`], the text-typed application surface
//!
//! ## Session Flow
//!
//! 1. **Connect**: the synchronizer opens its channel, arming a last will
//! 2. **Create or join**: the creator publishes session metadata; a joiner
//!    announces itself and requests a state snapshot
//! 3. **Replicate**: entity announcements, updates and removals flow over
//!    the session's entity topic
//! 4. **Leave**: delete-with-client entities are removed, then the client
//!    announces its departure and disconnects
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use worldsync_sync::entity_model::memory::MemoryEntityModel;
//! use worldsync_sync::{MemoryBroker, SynchronizationManager};
//!
//! let broker = MemoryBroker::default();
//! let manager = SynchronizationManager::new(
//!     Arc::new(broker),
//!     Arc::new(MemoryEntityModel::new()),
//! );
//! assert!(manager.is_empty());
//! ```

pub mod entity_model;
mod error;
pub mod events;
pub mod facade;
pub mod identity;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod synchronizer;
pub mod topics;
pub mod transport;

pub use entity_model::{AssetManifest, EntityHandle, EntityModel};
pub use error::{SyncError, SyncResult};
pub use events::{
    JoinCallback, JoinedSession, ListenerId, MessageCallback, SessionEvent, SessionEventHandler,
    SessionSnapshot, StateCallback,
};
pub use facade::{SessionRequest, WorldSync};
pub use identity::{ClientIdentity, ResolvedIdentity};
pub use manager::{ManagerConfig, SessionParams, SynchronizationManager};
pub use protocol::{Envelope, SessionMessage, PROTOCOL_VERSION};
pub use registry::{SynchronizedEntity, SynchronizedEntityRegistry};
pub use session::{Member, Session, SessionRole};
pub use synchronizer::{
    Synchronizer, SynchronizerConfig, SynchronizerConnection, SynchronizerState,
    WeakSynchronizer,
};
pub use topics::{TopicScheme, DEFAULT_TOPIC_ROOT};
pub use transport::memory::{
    MemoryBroker, MemoryChannel, MemoryNetwork, PublishedMessage, DEFAULT_LOG_CAPACITY,
};
pub use transport::{
    ChannelEvent, ChannelFactory, ChannelState, ConnectOptions, LastWill, MessageChannel, QoS,
};
