//! Synchronized entity registry.
//!
//! Per-session bookkeeping of which entities are replicated, who owns them,
//! and what happens to them when their owner leaves. The registry stores
//! replication metadata only; entity state lives in the entity model.

use crate::entity_model::AssetManifest;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use worldsync_types::{ClientId, EntityId};

/// Replication metadata for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizedEntity {
    pub entity_id: EntityId,
    /// Client that started synchronizing the entity.
    pub owner: ClientId,
    /// Remove the entity from the session when its owner disconnects.
    pub delete_with_client: bool,
    /// Assets peers need to reconstruct the entity.
    pub manifest: Option<AssetManifest>,
}

impl SynchronizedEntity {
    pub fn new(entity_id: EntityId, owner: ClientId, delete_with_client: bool) -> Self {
        Self {
            entity_id,
            owner,
            delete_with_client,
            manifest: None,
        }
    }

    pub fn with_manifest(mut self, manifest: Option<AssetManifest>) -> Self {
        self.manifest = manifest;
        self
    }
}

#[derive(Debug, Clone)]
struct Entry {
    entity: SynchronizedEntity,
    seq: u64,
}

/// Table of synchronized entities for one session.
#[derive(Debug, Default)]
pub struct SynchronizedEntityRegistry {
    entries: HashMap<EntityId, Entry>,
    next_seq: u64,
}

impl SynchronizedEntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new entity. Fails if it is already registered.
    pub fn insert(&mut self, entity: SynchronizedEntity) -> SyncResult<()> {
        if self.entries.contains_key(&entity.entity_id) {
            return Err(SyncError::EntityAlreadySynchronized(entity.entity_id));
        }
        self.upsert(entity);
        Ok(())
    }

    /// Registers or replaces an entity. Returns `true` if it was not present.
    ///
    /// A replaced entry keeps its original position in [`Self::snapshot`].
    pub fn upsert(&mut self, entity: SynchronizedEntity) -> bool {
        if let Some(entry) = self.entries.get_mut(&entity.entity_id) {
            entry.entity = entity;
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(entity.entity_id, Entry { entity, seq });
        true
    }

    /// Removes an entity, returning its metadata if it was registered.
    pub fn remove(&mut self, entity_id: &EntityId) -> Option<SynchronizedEntity> {
        self.entries.remove(entity_id).map(|e| e.entity)
    }

    pub fn contains(&self, entity_id: &EntityId) -> bool {
        self.entries.contains_key(entity_id)
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<&SynchronizedEntity> {
        self.entries.get(entity_id).map(|e| &e.entity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entities in registration order.
    pub fn snapshot(&self) -> Vec<SynchronizedEntity> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.entity.clone()).collect()
    }

    /// Entities owned by `owner`, in registration order.
    pub fn owned_by(&self, owner: &ClientId) -> Vec<SynchronizedEntity> {
        self.snapshot()
            .into_iter()
            .filter(|e| &e.owner == owner)
            .collect()
    }

    /// Removes and returns every entity of `owner` flagged delete-with-client.
    pub fn remove_deletable_owned_by(&mut self, owner: &ClientId) -> Vec<SynchronizedEntity> {
        let doomed: Vec<EntityId> = self
            .owned_by(owner)
            .into_iter()
            .filter(|e| e.delete_with_client)
            .map(|e| e.entity_id)
            .collect();
        doomed.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str) -> ClientId {
        ClientId::new(name).unwrap()
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut registry = SynchronizedEntityRegistry::new();
        let id = EntityId::new();
        registry
            .insert(SynchronizedEntity::new(id, client("a"), true))
            .unwrap();
        let err = registry
            .insert(SynchronizedEntity::new(id, client("a"), false))
            .unwrap_err();
        assert!(matches!(err, SyncError::EntityAlreadySynchronized(e) if e == id));
        assert!(registry.get(&id).unwrap().delete_with_client);
    }

    #[test]
    fn remove_then_insert_behaves_like_new() {
        let mut registry = SynchronizedEntityRegistry::new();
        let id = EntityId::new();
        registry
            .insert(SynchronizedEntity::new(id, client("a"), true))
            .unwrap();
        assert!(registry.remove(&id).is_some());
        assert!(!registry.contains(&id));
        registry
            .insert(SynchronizedEntity::new(id, client("a"), false))
            .unwrap();
        assert!(!registry.get(&id).unwrap().delete_with_client);
    }

    #[test]
    fn snapshot_keeps_registration_order() {
        let mut registry = SynchronizedEntityRegistry::new();
        let ids: Vec<EntityId> = (0..5).map(|_| EntityId::new()).collect();
        for id in &ids {
            registry.upsert(SynchronizedEntity::new(*id, client("a"), false));
        }
        // Re-announcing does not move an entity.
        registry.upsert(SynchronizedEntity::new(ids[0], client("a"), true));

        let order: Vec<EntityId> = registry.snapshot().iter().map(|e| e.entity_id).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn remove_deletable_only_touches_flagged_entities_of_owner() {
        let mut registry = SynchronizedEntityRegistry::new();
        let a_doomed = EntityId::new();
        let a_kept = EntityId::new();
        let b_doomed = EntityId::new();
        registry.upsert(SynchronizedEntity::new(a_doomed, client("a"), true));
        registry.upsert(SynchronizedEntity::new(a_kept, client("a"), false));
        registry.upsert(SynchronizedEntity::new(b_doomed, client("b"), true));

        let removed = registry.remove_deletable_owned_by(&client("a"));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].entity_id, a_doomed);
        assert!(registry.contains(&a_kept));
        assert!(registry.contains(&b_doomed));
        assert_eq!(registry.len(), 2);
    }
}
