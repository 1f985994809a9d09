//! Entity registry: which handles the session tracks, and in what status.
//!
//! The registry reads entity state to learn identities but never holds an
//! entity lock across calls. Callers that need both must take the registry
//! first.

use crate::entity::EntityRef;
use crate::error::{CoreError, CoreResult};
use crate::identity::EntityIdentity;
use crate::types::{EntityStatus, HandleId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

struct Entry {
    entity: EntityRef,
    status: EntityStatus,
    seq: u64,
    identity: EntityIdentity,
}

/// Table of tracked entities.
#[derive(Default)]
pub(crate) struct EntityRegistry {
    entries: HashMap<HandleId, Entry>,
    by_identity: HashMap<EntityIdentity, HandleId>,
    next_seq: u64,
}

impl EntityRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `entity` and returns the canonical handle.
    ///
    /// If an entity with an equal keyed identity is already tracked, that
    /// entity is returned and `entity` stays untracked. Attaching an
    /// already tracked entity keeps its current status.
    pub(crate) fn attach(&mut self, entity: &EntityRef, status: EntityStatus) -> EntityRef {
        if self.entries.contains_key(&entity.id()) {
            return Arc::clone(entity);
        }

        let identity = entity.identity();
        if identity.is_keyed() {
            if let Some(existing) = self
                .by_identity
                .get(&identity)
                .and_then(|id| self.entries.get(id))
            {
                debug!(
                    handle = %entity.id(),
                    canonical = %existing.entity.id(),
                    identity = %identity,
                    "reusing tracked entity with equal identity"
                );
                return Arc::clone(&existing.entity);
            }
            self.by_identity.insert(identity.clone(), entity.id());
        }

        self.next_seq += 1;
        self.entries.insert(
            entity.id(),
            Entry {
                entity: Arc::clone(entity),
                status,
                seq: self.next_seq,
                identity,
            },
        );
        debug!(handle = %entity.id(), status = %status, "attached");
        Arc::clone(entity)
    }

    pub(crate) fn is_attached(&self, entity: &EntityRef) -> bool {
        self.entries.contains_key(&entity.id())
    }

    pub(crate) fn status(&self, entity: &EntityRef) -> CoreResult<EntityStatus> {
        self.entries
            .get(&entity.id())
            .map(|entry| entry.status)
            .ok_or(CoreError::NotAttached { handle: entity.id() })
    }

    pub(crate) fn set_status(&mut self, entity: &EntityRef, status: EntityStatus) -> CoreResult<()> {
        let entry = self
            .entries
            .get_mut(&entity.id())
            .ok_or(CoreError::NotAttached { handle: entity.id() })?;
        if entry.status != status {
            debug!(handle = %entity.id(), from = %entry.status, to = %status, "status change");
            entry.status = status;
        }
        Ok(())
    }

    /// Applies the setter transition to a tracked entity.
    pub(crate) fn mark_edited(&mut self, entity: &EntityRef) -> CoreResult<EntityStatus> {
        let next = self.status(entity)?.after_edit();
        self.set_status(entity, next)?;
        Ok(next)
    }

    /// Re-reads the identity of a tracked entity after its key became known.
    pub(crate) fn rekey(&mut self, entity: &EntityRef) {
        let identity = entity.identity();
        let Some(entry) = self.entries.get_mut(&entity.id()) else {
            return;
        };
        if entry.identity == identity {
            return;
        }
        if self.by_identity.get(&entry.identity) == Some(&entity.id()) {
            self.by_identity.remove(&entry.identity);
        }
        entry.identity = identity.clone();
        if identity.is_keyed() {
            if let Some(other) = self.by_identity.get(&identity) {
                warn!(
                    handle = %entity.id(),
                    existing = %other,
                    identity = %identity,
                    "identity already tracked by another handle"
                );
                return;
            }
            self.by_identity.insert(identity, entity.id());
        }
    }

    /// Tracked entity with the given identity.
    pub(crate) fn find(&self, identity: &EntityIdentity) -> Option<EntityRef> {
        self.by_identity
            .get(identity)
            .and_then(|id| self.entries.get(id))
            .map(|entry| Arc::clone(&entry.entity))
    }

    /// Snapshot of tracked entities in attach order.
    pub(crate) fn iterate(&self) -> Vec<(EntityRef, EntityStatus)> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
            .into_iter()
            .map(|entry| (Arc::clone(&entry.entity), entry.status))
            .collect()
    }

    pub(crate) fn detach(&mut self, entity: &EntityRef) -> bool {
        match self.entries.remove(&entity.id()) {
            Some(entry) => {
                if self.by_identity.get(&entry.identity) == Some(&entity.id()) {
                    self.by_identity.remove(&entry.identity);
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn detach_all(&mut self) {
        debug!(count = self.entries.len(), "detaching all entities");
        self.entries.clear();
        self.by_identity.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityCell, EntityState};

    fn entity(id: u64, key: Option<&str>) -> EntityRef {
        let identity = EntityIdentity::new(
            "Docs",
            "DocsService",
            "Files",
            "Docs.File",
            key.map(str::to_string),
        );
        let address = key.map(|k| format!("Files({k})"));
        EntityCell::new(HandleId::new(id), EntityState::new(identity, address, None))
    }

    #[test]
    fn status_requires_attach() {
        let registry = EntityRegistry::new();
        let e = entity(1, Some("1"));
        assert!(matches!(
            registry.status(&e),
            Err(CoreError::NotAttached { handle }) if handle == HandleId::new(1)
        ));
    }

    #[test]
    fn attach_dedups_equal_identities() {
        let mut registry = EntityRegistry::new();
        let a = entity(1, Some("7"));
        let b = entity(2, Some("7"));
        let first = registry.attach(&a, EntityStatus::Attached);
        let second = registry.attach(&b, EntityStatus::Linked);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!registry.is_attached(&b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.status(&a).unwrap(), EntityStatus::Attached);
    }

    #[test]
    fn unkeyed_entities_never_collide() {
        let mut registry = EntityRegistry::new();
        let a = entity(1, None);
        let b = entity(2, None);
        registry.attach(&a, EntityStatus::New);
        registry.attach(&b, EntityStatus::New);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn reattach_keeps_status() {
        let mut registry = EntityRegistry::new();
        let a = entity(1, Some("1"));
        registry.attach(&a, EntityStatus::Linked);
        registry.attach(&a, EntityStatus::Attached);
        assert_eq!(registry.status(&a).unwrap(), EntityStatus::Linked);
    }

    #[test]
    fn mark_edited_transitions() {
        let mut registry = EntityRegistry::new();
        let durable = entity(1, Some("1"));
        let fresh = entity(2, None);
        registry.attach(&durable, EntityStatus::Linked);
        registry.attach(&fresh, EntityStatus::New);
        assert_eq!(registry.mark_edited(&durable).unwrap(), EntityStatus::Changed);
        assert_eq!(registry.mark_edited(&fresh).unwrap(), EntityStatus::New);
    }

    #[test]
    fn iterate_is_a_snapshot_in_attach_order() {
        let mut registry = EntityRegistry::new();
        let entities: Vec<_> = (1..=4).map(|i| entity(i, None)).collect();
        for e in entities.iter().rev() {
            registry.attach(e, EntityStatus::New);
        }
        let snapshot = registry.iterate();
        registry.attach(&entity(9, None), EntityStatus::New);
        let ids: Vec<u64> = snapshot.iter().map(|(e, _)| e.id().as_u64()).collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn rekey_makes_created_entities_findable() {
        let mut registry = EntityRegistry::new();
        let e = entity(1, None);
        registry.attach(&e, EntityStatus::New);
        let keyed = e.identity().with_key(Some("5".into()));
        e.write().identity = keyed;
        registry.rekey(&e);
        let found = registry
            .find(&EntityIdentity::new("Docs", "DocsService", "Files", "Docs.File", Some("5".into())))
            .unwrap();
        assert!(Arc::ptr_eq(&found, &e));
    }

    #[test]
    fn detach_all_clears() {
        let mut registry = EntityRegistry::new();
        let e = entity(1, Some("1"));
        registry.attach(&e, EntityStatus::Attached);
        registry.detach_all();
        assert!(registry.is_empty());
        assert!(registry.find(&e.identity()).is_none());
    }
}
