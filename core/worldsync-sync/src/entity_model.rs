//! Entity model abstraction.
//!
//! The 3-D scene owns entities; the sync layer only needs to find them, read
//! and write their transforms, and create or destroy replicas of remote
//! entities. Implementations must be callable from the synchronizer's
//! event-loop task.

use serde::{Deserialize, Serialize};
use std::fmt;
use worldsync_types::{EntityId, Transform};

/// Opaque handle to an entity inside the entity model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle(u64);

impl EntityHandle {
    /// Wraps an implementation-defined handle value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the implementation-defined handle value.
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Everything a remote peer needs to load an entity's assets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetManifest {
    /// Primary asset path (model, prefab, ...).
    pub file_path: String,
    /// Additional resources the asset depends on.
    #[serde(default)]
    pub resources: Vec<String>,
}

impl AssetManifest {
    pub fn new(file_path: impl Into<String>, resources: Vec<String>) -> Self {
        Self {
            file_path: file_path.into(),
            resources,
        }
    }

    /// Builds a manifest from the optional pieces an application passes in.
    /// Returns `None` when there is no file path.
    pub fn from_parts(file_path: Option<String>, resources: Option<Vec<String>>) -> Option<Self> {
        let file_path = file_path.filter(|p| !p.trim().is_empty())?;
        Some(Self::new(file_path, resources.unwrap_or_default()))
    }
}

impl fmt::Display for AssetManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (+{} resources)", self.file_path, self.resources.len())
    }
}

/// Capability interface into the external entity model.
pub trait EntityModel: Send + Sync {
    /// Looks up a live entity.
    fn find_entity(&self, id: &EntityId) -> Option<EntityHandle>;

    /// Reads an entity's current transform in local space.
    fn transform(&self, handle: EntityHandle) -> Option<Transform>;

    /// Applies a transform received from a peer (already in local space).
    fn apply_remote_transform(&self, handle: EntityHandle, transform: &Transform);

    /// Materializes a replica of a remote entity.
    fn create_entity_from_manifest(
        &self,
        id: EntityId,
        manifest: Option<&AssetManifest>,
        transform: &Transform,
    ) -> Option<EntityHandle>;

    /// Destroys an entity.
    fn destroy_entity(&self, handle: EntityHandle);
}

/// An in-process entity model for tests and headless peers.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Mutex, MutexGuard};

    /// A single entity stored by [`MemoryEntityModel`].
    #[derive(Debug, Clone, PartialEq)]
    pub struct MemoryEntity {
        pub id: EntityId,
        pub transform: Transform,
        pub manifest: Option<AssetManifest>,
        /// Whether this entity was created from a peer's announcement.
        pub replica: bool,
    }

    #[derive(Default)]
    struct Entities {
        by_handle: HashMap<EntityHandle, MemoryEntity>,
        by_id: HashMap<EntityId, EntityHandle>,
    }

    /// Thread-safe map of entities keyed by handle.
    #[derive(Default)]
    pub struct MemoryEntityModel {
        entities: Mutex<Entities>,
        next_handle: AtomicU64,
    }

    impl MemoryEntityModel {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, Entities> {
            self.entities
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        }

        fn insert(&self, entity: MemoryEntity) -> EntityHandle {
            let handle = EntityHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
            let mut entities = self.lock();
            if let Some(old) = entities.by_id.insert(entity.id, handle) {
                entities.by_handle.remove(&old);
            }
            entities.by_handle.insert(handle, entity);
            handle
        }

        /// Adds a locally-owned entity and returns its handle.
        pub fn spawn(&self, id: EntityId, transform: Transform) -> EntityHandle {
            self.insert(MemoryEntity {
                id,
                transform,
                manifest: None,
                replica: false,
            })
        }

        /// Overwrites the transform of a local entity.
        pub fn set_transform(&self, id: &EntityId, transform: Transform) -> bool {
            let mut entities = self.lock();
            let Some(handle) = entities.by_id.get(id).copied() else {
                return false;
            };
            match entities.by_handle.get_mut(&handle) {
                Some(entity) => {
                    entity.transform = transform;
                    true
                }
                None => false,
            }
        }

        /// Returns a copy of the entity with the given ID.
        pub fn get(&self, id: &EntityId) -> Option<MemoryEntity> {
            let entities = self.lock();
            let handle = entities.by_id.get(id)?;
            entities.by_handle.get(handle).cloned()
        }

        /// Whether an entity with this ID exists.
        pub fn contains(&self, id: &EntityId) -> bool {
            self.lock().by_id.contains_key(id)
        }

        /// Number of live entities.
        pub fn len(&self) -> usize {
            self.lock().by_handle.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl EntityModel for MemoryEntityModel {
        fn find_entity(&self, id: &EntityId) -> Option<EntityHandle> {
            self.lock().by_id.get(id).copied()
        }

        fn transform(&self, handle: EntityHandle) -> Option<Transform> {
            self.lock().by_handle.get(&handle).map(|e| e.transform)
        }

        fn apply_remote_transform(&self, handle: EntityHandle, transform: &Transform) {
            if let Some(entity) = self.lock().by_handle.get_mut(&handle) {
                entity.transform = *transform;
            }
        }

        fn create_entity_from_manifest(
            &self,
            id: EntityId,
            manifest: Option<&AssetManifest>,
            transform: &Transform,
        ) -> Option<EntityHandle> {
            Some(self.insert(MemoryEntity {
                id,
                transform: *transform,
                manifest: manifest.cloned(),
                replica: true,
            }))
        }

        fn destroy_entity(&self, handle: EntityHandle) {
            let mut entities = self.lock();
            if let Some(entity) = entities.by_handle.remove(&handle) {
                entities.by_id.remove(&entity.id);
            }
        }
    }
}
