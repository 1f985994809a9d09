//! Entity handles and their pending changes.
//!
//! Reads go through three tiers: pending changes, then the read cache,
//! then the last-known wire snapshot (decoded once and memoized). Cached
//! reads never leak into the pending changes, so unmodified values are
//! never re-submitted.

use crate::collection::CollectionHandle;
use crate::error::{CoreError, CoreResult};
use crate::identity::EntityIdentity;
use crate::metadata::{EntityTypeDescriptor, NavigationProperty};
use crate::session::SessionInner;
use crate::types::{EntityStatus, HandleId};
use entilink_codec::Value;
use entilink_protocol::{Cardinality, StreamPayload, WireEntity, WireLink};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Shared, lockable entity state.
pub(crate) type EntityRef = Arc<EntityCell>;

pub(crate) struct EntityCell {
    id: HandleId,
    type_name: String,
    entity_set: String,
    state: RwLock<EntityState>,
}

impl EntityCell {
    pub(crate) fn new(id: HandleId, state: EntityState) -> EntityRef {
        Arc::new(Self {
            id,
            type_name: state.identity.type_name.clone(),
            entity_set: state.identity.entity_set.clone(),
            state: RwLock::new(state),
        })
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn type_name(&self) -> &str {
        &self.type_name
    }

    pub(crate) fn entity_set(&self) -> &str {
        &self.entity_set
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, EntityState> {
        self.state.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, EntityState> {
        self.state.write()
    }

    pub(crate) fn identity(&self) -> EntityIdentity {
        self.read().identity.clone()
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.read().removed
    }

    /// Fails with `Removed` once a deletion has been committed.
    pub(crate) fn check_live(&self) -> CoreResult<()> {
        if self.is_removed() {
            Err(CoreError::Removed { handle: self.id })
        } else {
            Ok(())
        }
    }
}

/// A pending navigation edit.
#[derive(Clone)]
pub(crate) enum LinkChange {
    Single(Option<EntityRef>),
    /// Targets to bind, and linked targets to unbind.
    Collection {
        targets: Vec<EntityRef>,
        removed: Vec<EntityRef>,
    },
}

impl LinkChange {
    pub(crate) fn cardinality(&self) -> Cardinality {
        match self {
            LinkChange::Single(_) => Cardinality::Single,
            LinkChange::Collection { .. } => Cardinality::Collection,
        }
    }

    pub(crate) fn targets(&self) -> Vec<EntityRef> {
        match self {
            LinkChange::Single(target) => target.iter().cloned().collect(),
            LinkChange::Collection { targets, .. } => targets.clone(),
        }
    }

    /// Durable targets to unbind from a collection.
    pub(crate) fn removed(&self) -> &[EntityRef] {
        match self {
            LinkChange::Single(_) => &[],
            LinkChange::Collection { removed, .. } => removed,
        }
    }
}

/// Returns true if both cells stand for the same durable record.
pub(crate) fn same_record(a: &EntityRef, b: &EntityRef) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    let address = a.read().address.clone();
    address.is_some() && address == b.read().address
}

/// Resolved navigation data.
#[derive(Clone)]
pub(crate) enum CachedLink {
    Single(Option<EntityRef>),
    Collection {
        items: Vec<EntityRef>,
        uri: Option<String>,
    },
}

/// Where a navigation read is answered from.
enum Lookup {
    Pending(LinkChange),
    Cached(CachedLink),
    Wire {
        link: Option<WireLink>,
        address: Option<String>,
    },
}

impl Lookup {
    /// Copies what is needed out of the entity so no lock outlives the call.
    fn of(entity: &EntityCell, navigation: &str) -> Self {
        let state = entity.read();
        match state.link_changes.get(navigation) {
            Some(change) => Lookup::Pending(change.clone()),
            None => Self::committed_state(&state, navigation),
        }
    }

    /// Like [`Lookup::of`], ignoring pending edits.
    fn committed(entity: &EntityCell, navigation: &str) -> Self {
        Self::committed_state(&entity.read(), navigation)
    }

    fn committed_state(state: &EntityState, navigation: &str) -> Self {
        if let Some(cached) = state.link_cache.get(navigation) {
            return Lookup::Cached(cached.clone());
        }
        Lookup::Wire {
            link: state.snapshot.as_ref().and_then(|s| s.link(navigation)).cloned(),
            address: state.address.clone(),
        }
    }
}

/// Last-known server state plus pending local mutations.
pub(crate) struct EntityState {
    pub(crate) identity: EntityIdentity,
    pub(crate) snapshot: Option<WireEntity>,
    pub(crate) address: Option<String>,
    pub(crate) etag: Option<String>,
    pub(crate) property_changes: BTreeMap<String, Value>,
    pub(crate) property_cache: BTreeMap<String, Value>,
    pub(crate) link_changes: BTreeMap<String, LinkChange>,
    pub(crate) link_cache: BTreeMap<String, CachedLink>,
    pub(crate) stream_changes: BTreeMap<String, StreamPayload>,
    pub(crate) media_change: Option<StreamPayload>,
    pub(crate) removed: bool,
}

impl EntityState {
    pub(crate) fn new(
        identity: EntityIdentity,
        address: Option<String>,
        snapshot: Option<WireEntity>,
    ) -> Self {
        Self {
            etag: snapshot.as_ref().and_then(|s| s.etag.clone()),
            identity,
            snapshot,
            address,
            property_changes: BTreeMap::new(),
            property_cache: BTreeMap::new(),
            link_changes: BTreeMap::new(),
            link_cache: BTreeMap::new(),
            stream_changes: BTreeMap::new(),
            media_change: None,
            removed: false,
        }
    }

    /// Returns true if any mutation is waiting to be committed.
    pub(crate) fn has_pending_edits(&self) -> bool {
        !self.property_changes.is_empty()
            || !self.link_changes.is_empty()
            || !self.stream_changes.is_empty()
            || self.media_change.is_some()
    }

    pub(crate) fn clear_pending(&mut self) {
        self.property_changes.clear();
        self.link_changes.clear();
        self.stream_changes.clear();
        self.media_change = None;
    }

    pub(crate) fn media_etag(&self) -> Option<String> {
        self.snapshot
            .as_ref()
            .and_then(|s| s.media.as_ref())
            .and_then(|m| m.etag.clone())
    }
}

/// Local representative of one remote record.
///
/// Handles are cheap to clone; clones share state. Every accessor routes
/// through the session's registry: the first read of a fetched entity
/// attaches it as `ATTACHED`, the first edit moves it to `CHANGED`.
#[derive(Clone)]
pub struct EntityHandle {
    session: Arc<SessionInner>,
    entity: EntityRef,
}

impl EntityHandle {
    pub(crate) fn new(session: Arc<SessionInner>, entity: EntityRef) -> Self {
        Self { session, entity }
    }

    pub(crate) fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub(crate) fn session(&self) -> &Arc<SessionInner> {
        &self.session
    }

    /// Session-unique handle ID.
    pub fn id(&self) -> HandleId {
        self.entity.id()
    }

    /// Qualified type name.
    pub fn type_name(&self) -> &str {
        self.entity.type_name()
    }

    /// Entity set (or singleton) the entity belongs to.
    pub fn entity_set(&self) -> &str {
        self.entity.entity_set()
    }

    /// Current identity. The key is absent until creation is committed.
    pub fn identity(&self) -> EntityIdentity {
        self.entity.identity()
    }

    /// Durable address, relative to the service root.
    pub fn address(&self) -> Option<String> {
        self.entity.read().address.clone()
    }

    /// Concurrency token.
    pub fn etag(&self) -> Option<String> {
        self.entity.read().etag.clone()
    }

    /// Returns true once a deletion of this entity has been committed.
    pub fn is_removed(&self) -> bool {
        self.entity.is_removed()
    }

    /// Registry status. Fails with `NotAttached` for untracked handles.
    pub fn status(&self) -> CoreResult<EntityStatus> {
        self.session.registry.lock().status(&self.entity)
    }

    /// Returns true if the registry tracks this handle.
    pub fn is_attached(&self) -> bool {
        self.session.registry.lock().is_attached(&self.entity)
    }

    /// Returns true if the entity has anything to commit.
    pub fn is_dirty(&self) -> bool {
        let status = self.session.registry.lock().status(&self.entity).ok();
        self.entity.read().has_pending_edits() || status.is_some_and(EntityStatus::is_dirty)
    }

    /// Names of properties with pending edits.
    pub fn changed_properties(&self) -> Vec<String> {
        self.entity.read().property_changes.keys().cloned().collect()
    }

    /// Returns true if both handles stand for the same record.
    pub fn same_entity(&self, other: &EntityHandle) -> bool {
        if Arc::ptr_eq(&self.entity, &other.entity) {
            return true;
        }
        let (a, b) = (self.identity(), other.identity());
        a.is_keyed() && a == b
    }

    fn entity_type(&self) -> CoreResult<&EntityTypeDescriptor> {
        self.session.metadata.entity_type(self.entity.type_name())
    }

    fn navigation(&self, name: &str, cardinality: Cardinality) -> CoreResult<NavigationProperty> {
        let navigation = self.entity_type()?.navigation_property(name)?;
        if navigation.cardinality != cardinality {
            return Err(CoreError::illegal_argument(format!(
                "{}.{name} is {:?}-valued",
                self.type_name(),
                navigation.cardinality
            )));
        }
        Ok(navigation.clone())
    }

    /// Reads a structural property.
    pub fn get(&self, property: &str) -> CoreResult<Value> {
        let ty = self.entity_type()?.property_type(property)?.clone();
        let entity = self.session.track(&self.entity, false)?;

        let wire = {
            let state = entity.read();
            if let Some(value) = state.property_changes.get(property) {
                return Ok(value.clone());
            }
            if let Some(value) = state.property_cache.get(property) {
                return Ok(value.clone());
            }
            state
                .snapshot
                .as_ref()
                .and_then(|s| s.property(property))
                .cloned()
        };

        let value = match wire {
            Some(wire) => self.session.codec.decode(&wire, &ty)?,
            None => Value::Null,
        };
        entity
            .write()
            .property_cache
            .entry(property.to_string())
            .or_insert_with(|| value.clone());
        Ok(value)
    }

    /// Sets a structural property. Nothing is sent until flush.
    pub fn set(&self, property: &str, value: impl Into<Value>) -> CoreResult<()> {
        self.entity_type()?.property_type(property)?;
        let value = value.into();
        let entity = self.session.track(&self.entity, true)?;
        entity
            .write()
            .property_changes
            .insert(property.to_string(), value);
        Ok(())
    }

    /// Reads a single-valued navigation property.
    ///
    /// Unresolved targets are fetched once and cached.
    pub fn navigate(&self, navigation: &str) -> CoreResult<Option<EntityHandle>> {
        let nav = self.navigation(navigation, Cardinality::Single)?;
        let entity = self.session.track(&self.entity, false)?;

        let (link, address) = match Lookup::of(&entity, navigation) {
            Lookup::Pending(LinkChange::Single(target))
            | Lookup::Cached(CachedLink::Single(target)) => return self.live(target),
            Lookup::Pending(LinkChange::Collection { .. }) | Lookup::Cached(_) => {
                return Err(CoreError::illegal_argument(format!(
                    "{navigation} holds a collection"
                )))
            }
            Lookup::Wire { link, address } => (link, address),
        };

        let address = address.ok_or(CoreError::NotYetDurable { handle: entity.id() })?;
        let target_set = self.session.metadata.target_set(&nav)?;
        let target = match link {
            Some(WireLink::Entity(wire)) => Some(self.session.materialize(*wire, &target_set)?),
            Some(WireLink::Null) => None,
            Some(WireLink::Entities(_)) => {
                return Err(CoreError::illegal_argument(format!(
                    "{navigation} carries a collection"
                )))
            }
            Some(WireLink::Deferred(uri)) => self.fetch_single(&uri, &target_set)?,
            None => self.fetch_single(&format!("{address}/{navigation}"), &target_set)?,
        };

        entity
            .write()
            .link_cache
            .insert(navigation.to_string(), CachedLink::Single(target.clone()));
        self.live(target)
    }

    fn fetch_single(&self, uri: &str, target_set: &str) -> CoreResult<Option<EntityRef>> {
        debug!(handle = %self.id(), uri, "fetching navigation target");
        self.session
            .transport
            .fetch_entity(uri)?
            .map(|wire| self.session.materialize(wire, target_set))
            .transpose()
    }

    fn live(&self, target: Option<EntityRef>) -> CoreResult<Option<EntityHandle>> {
        match target {
            Some(target) => {
                target.check_live()?;
                Ok(Some(EntityHandle::new(Arc::clone(&self.session), target)))
            }
            None => Ok(None),
        }
    }

    /// Reads a collection-valued navigation property.
    ///
    /// Pending edits are applied over the last-known linked set: targets
    /// queued for removal are left out and added targets are appended.
    pub fn navigate_collection(&self, navigation: &str) -> CoreResult<CollectionHandle> {
        let nav = self.navigation(navigation, Cardinality::Collection)?;
        let entity = self.session.track(&self.entity, false)?;

        let (targets, removed) = match Lookup::of(&entity, navigation) {
            Lookup::Pending(LinkChange::Collection { targets, removed }) => (targets, removed),
            Lookup::Pending(LinkChange::Single(_)) => {
                return Err(CoreError::illegal_argument(format!(
                    "{navigation} holds a single entity"
                )))
            }
            _ => {
                let (items, uri) = self.linked_collection(&entity, navigation, &nav)?;
                return self.live_collection(items, uri, &nav);
            }
        };
        if entity.read().address.is_none() {
            return self.live_collection(targets, None, &nav);
        }

        let (linked, _) = self.linked_collection(&entity, navigation, &nav)?;
        let mut items: Vec<EntityRef> = linked
            .into_iter()
            .filter(|item| {
                !removed.iter().any(|r| same_record(r, item))
                    && !targets.iter().any(|t| same_record(t, item))
            })
            .collect();
        items.extend(targets);
        self.live_collection(items, None, &nav)
    }

    /// Last-known linked set of a collection navigation, fetched once.
    fn linked_collection(
        &self,
        entity: &EntityRef,
        navigation: &str,
        nav: &NavigationProperty,
    ) -> CoreResult<(Vec<EntityRef>, Option<String>)> {
        let (link, address) = match Lookup::committed(entity, navigation) {
            Lookup::Cached(CachedLink::Collection { items, uri }) => return Ok((items, uri)),
            Lookup::Cached(_) | Lookup::Pending(_) => {
                return Err(CoreError::illegal_argument(format!(
                    "{navigation} holds a single entity"
                )))
            }
            Lookup::Wire { link, address } => (link, address),
        };

        let address = address.ok_or(CoreError::NotYetDurable { handle: entity.id() })?;
        let target_set = self.session.metadata.target_set(nav)?;
        let default_uri = format!("{address}/{navigation}");
        let (wires, uri) = match link {
            Some(WireLink::Entities(wires)) => (wires, default_uri),
            Some(WireLink::Deferred(uri)) => (self.session.transport.fetch_collection(&uri)?, uri),
            Some(WireLink::Entity(_)) | Some(WireLink::Null) => {
                return Err(CoreError::illegal_argument(format!(
                    "{navigation} carries a single entity"
                )))
            }
            None => (
                self.session.transport.fetch_collection(&default_uri)?,
                default_uri,
            ),
        };
        let items = wires
            .into_iter()
            .map(|wire| self.session.materialize(wire, &target_set))
            .collect::<CoreResult<Vec<_>>>()?;

        entity.write().link_cache.insert(
            navigation.to_string(),
            CachedLink::Collection {
                items: items.clone(),
                uri: Some(uri.clone()),
            },
        );
        Ok((items, Some(uri)))
    }

    fn live_collection(
        &self,
        items: Vec<EntityRef>,
        uri: Option<String>,
        nav: &NavigationProperty,
    ) -> CoreResult<CollectionHandle> {
        for item in &items {
            item.check_live()?;
        }
        Ok(CollectionHandle::new(
            Arc::clone(&self.session),
            items,
            uri,
            nav.target_type.clone(),
        ))
    }

    fn link_target(&self, nav: &NavigationProperty, target: &EntityHandle) -> CoreResult<EntityRef> {
        if !Arc::ptr_eq(&self.session, &target.session) {
            return Err(CoreError::illegal_argument(
                "link target belongs to another session",
            ));
        }
        if target.type_name() != nav.target_type {
            return Err(CoreError::illegal_argument(format!(
                "{}.{} expects {}, got {}",
                self.type_name(),
                nav.name,
                nav.target_type,
                target.type_name()
            )));
        }
        self.session.track_target(&target.entity)
    }

    /// Sets or clears a single-valued navigation property.
    pub fn set_link(&self, navigation: &str, target: Option<&EntityHandle>) -> CoreResult<()> {
        let nav = self.navigation(navigation, Cardinality::Single)?;
        let target = target.map(|t| self.link_target(&nav, t)).transpose()?;
        let entity = self.session.track(&self.entity, true)?;
        entity
            .write()
            .link_changes
            .insert(navigation.to_string(), LinkChange::Single(target));
        Ok(())
    }

    /// Replaces the targets of a collection-valued navigation property.
    ///
    /// On a durable entity the currently linked set is resolved first, so
    /// that targets left out of `targets` are unbound on flush.
    pub fn set_links<'a>(
        &self,
        navigation: &str,
        targets: impl IntoIterator<Item = &'a EntityHandle>,
    ) -> CoreResult<()> {
        let nav = self.navigation(navigation, Cardinality::Collection)?;
        let targets = targets
            .into_iter()
            .map(|t| self.link_target(&nav, t))
            .collect::<CoreResult<Vec<_>>>()?;

        let entity = self.session.track(&self.entity, false)?;
        let removed = if entity.read().address.is_some() {
            let (linked, _) = self.linked_collection(&entity, navigation, &nav)?;
            linked
                .into_iter()
                .filter(|item| !targets.iter().any(|t| same_record(t, item)))
                .collect()
        } else {
            Vec::new()
        };

        let entity = self.session.track(&entity, true)?;
        entity.write().link_changes.insert(
            navigation.to_string(),
            LinkChange::Collection { targets, removed },
        );
        Ok(())
    }

    /// Adds one target to a collection-valued navigation property.
    ///
    /// Targets already linked stay linked.
    pub fn add_link(&self, navigation: &str, target: &EntityHandle) -> CoreResult<()> {
        let nav = self.navigation(navigation, Cardinality::Collection)?;
        let target = self.link_target(&nav, target)?;
        let entity = self.session.track(&self.entity, true)?;
        let pending = entity.read().link_changes.get(navigation).cloned();
        let (mut targets, mut removed) = match pending {
            None => (Vec::new(), Vec::new()),
            Some(LinkChange::Collection { targets, removed }) => (targets, removed),
            Some(LinkChange::Single(_)) => {
                return Err(CoreError::illegal_argument(format!(
                    "{navigation} holds a single entity"
                )))
            }
        };
        removed.retain(|r| !same_record(r, &target));
        if !targets.iter().any(|t| Arc::ptr_eq(t, &target)) {
            targets.push(target);
        }
        entity.write().link_changes.insert(
            navigation.to_string(),
            LinkChange::Collection { targets, removed },
        );
        Ok(())
    }

    /// Replaces a named stream property.
    pub fn set_stream(&self, name: &str, payload: StreamPayload) -> CoreResult<()> {
        self.entity_type()?.check_stream(name)?;
        let entity = self.session.track(&self.entity, true)?;
        entity
            .write()
            .stream_changes
            .insert(name.to_string(), payload);
        Ok(())
    }

    /// Reads a named stream property.
    pub fn get_stream(&self, name: &str) -> CoreResult<StreamPayload> {
        self.entity_type()?.check_stream(name)?;
        let entity = self.session.track(&self.entity, false)?;
        let uri = {
            let state = entity.read();
            if let Some(payload) = state.stream_changes.get(name) {
                return Ok(payload.clone());
            }
            let address = state
                .address
                .as_ref()
                .ok_or(CoreError::NotYetDurable { handle: entity.id() })?;
            state
                .snapshot
                .as_ref()
                .and_then(|s| s.stream_links.get(name).cloned())
                .unwrap_or_else(|| format!("{address}/{name}"))
        };
        Ok(self.session.transport.fetch_stream(&uri)?)
    }

    /// Replaces the binary content of a media entity.
    pub fn set_media(&self, payload: StreamPayload) -> CoreResult<()> {
        self.check_media()?;
        let entity = self.session.track(&self.entity, true)?;
        entity.write().media_change = Some(payload);
        Ok(())
    }

    /// Reads the binary content of a media entity.
    pub fn get_media(&self) -> CoreResult<StreamPayload> {
        self.check_media()?;
        let entity = self.session.track(&self.entity, false)?;
        let uri = {
            let state = entity.read();
            if let Some(payload) = &state.media_change {
                return Ok(payload.clone());
            }
            let address = state
                .address
                .as_ref()
                .ok_or(CoreError::NotYetDurable { handle: entity.id() })?;
            state
                .snapshot
                .as_ref()
                .and_then(|s| s.media.as_ref())
                .and_then(|m| m.read_link.clone())
                .unwrap_or_else(|| format!("{address}/$value"))
        };
        Ok(self.session.transport.fetch_stream(&uri)?)
    }

    fn check_media(&self) -> CoreResult<()> {
        if self.entity_type()?.has_stream {
            Ok(())
        } else {
            Err(CoreError::illegal_argument(format!(
                "{} is not a media entity",
                self.type_name()
            )))
        }
    }

    /// Marks the entity for deletion.
    ///
    /// An entity that was never created is simply dropped from the
    /// registry; no operation is sent for it.
    pub fn delete(&self) -> CoreResult<()> {
        let entity = self.session.track(&self.entity, false)?;
        let mut registry = self.session.registry.lock();
        if registry.status(&entity)? == EntityStatus::New {
            registry.detach(&entity);
            let mut state = entity.write();
            state.clear_pending();
            state.removed = true;
            debug!(handle = %entity.id(), "dropped unsaved entity");
        } else {
            registry.set_status(&entity, EntityStatus::Deleted)?;
        }
        Ok(())
    }

    /// Re-reads the entity from the service.
    ///
    /// Read caches are discarded; pending edits are kept.
    pub fn refresh(&self) -> CoreResult<()> {
        let entity = self.session.track(&self.entity, false)?;
        let address = entity
            .read()
            .address
            .clone()
            .ok_or(CoreError::NotYetDurable { handle: entity.id() })?;
        let mut wire = self
            .session
            .transport
            .fetch_entity(&address)?
            .ok_or_else(|| CoreError::not_found(address.clone()))?;
        self.session.prepare_wire(&mut wire, entity.type_name())?;

        let mut state = entity.write();
        if wire.etag.is_some() {
            state.etag = wire.etag.clone();
        }
        state.snapshot = Some(wire);
        state.property_cache.clear();
        state.link_cache.clear();
        debug!(handle = %entity.id(), %address, "refreshed");
        Ok(())
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandle")
            .field("id", &self.id())
            .field("type", &self.type_name())
            .field("address", &self.address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::{file_wire, folder_wire, session_with, MockSetup};
    use crate::transport::MockTransport;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn first_read_attaches_as_attached() {
        let (session, transport) = session_with(MockSetup::default());
        transport.set_entity("Folders(1)", folder_wire(1, "Projects"));
        let folder = session.container().entity_set("Folders").unwrap().by_key(1).unwrap();

        assert!(!folder.is_attached());
        assert_eq!(folder.get("Name").unwrap(), Value::from("Projects"));
        assert_eq!(folder.status().unwrap(), EntityStatus::Attached);
    }

    #[test]
    fn reads_do_not_become_changes() {
        let (session, transport) = session_with(MockSetup::default());
        transport.set_entity("Folders(1)", folder_wire(1, "Projects"));
        let folder = session.container().entity_set("Folders").unwrap().by_key(1).unwrap();

        folder.get("Name").unwrap();
        folder.get("Name").unwrap();
        assert!(folder.changed_properties().is_empty());
        assert!(!folder.is_dirty());
    }

    #[test]
    fn setter_moves_attached_to_changed() {
        let (session, transport) = session_with(MockSetup::default());
        transport.set_entity("Folders(1)", folder_wire(1, "Projects"));
        let folder = session.container().entity_set("Folders").unwrap().by_key(1).unwrap();

        folder.set("Name", "Archive").unwrap();
        assert_eq!(folder.status().unwrap(), EntityStatus::Changed);
        assert_eq!(folder.get("Name").unwrap(), Value::from("Archive"));
        assert_eq!(folder.changed_properties(), vec!["Name".to_string()]);
        assert!(folder.is_dirty());
    }

    #[test]
    fn unknown_property_is_illegal() {
        let (session, _) = session_with(MockSetup::default());
        let folder = session.container().entity_set("Folders").unwrap().create().unwrap();
        assert!(matches!(
            folder.set("Colour", "red"),
            Err(CoreError::IllegalArgument { .. })
        ));
    }

    #[test]
    fn navigation_on_new_entity_is_not_durable() {
        let (session, _) = session_with(MockSetup::default());
        let file = session.container().entity_set("Files").unwrap().create().unwrap();
        assert!(matches!(
            file.navigate("Parent"),
            Err(CoreError::NotYetDurable { .. })
        ));
    }

    #[test]
    fn navigation_prefers_pending_links() {
        let (session, _) = session_with(MockSetup::default());
        let files = session.container().entity_set("Files").unwrap();
        let folders = session.container().entity_set("Folders").unwrap();
        let file = files.create().unwrap();
        let folder = folders.create().unwrap();

        file.set_link("Parent", Some(&folder)).unwrap();
        let parent = file.navigate("Parent").unwrap().unwrap();
        assert!(parent.same_entity(&folder));
    }

    fn folder_with_files(transport: &MockTransport) {
        transport.set_entity("Folders(1)", folder_wire(1, "Projects"));
        transport.set_collection(
            "Folders(1)/Files",
            vec![file_wire(1, "a.txt"), file_wire(2, "b.txt")],
        );
    }

    #[test]
    fn set_links_replaces_the_linked_set() {
        let (session, transport) = session_with(MockSetup::default());
        folder_with_files(&transport);
        let folder = session.container().entity_set("Folders").unwrap().by_key(1).unwrap();
        let added = session.container().create("Files").unwrap();
        folder.set_links("Files", [&added]).unwrap();

        let files = folder.navigate_collection("Files").unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains(&added));

        let state = folder.entity().read();
        let removed: Vec<_> = state.link_changes["Files"]
            .removed()
            .iter()
            .map(|r| r.read().address.clone())
            .collect();
        assert_eq!(
            removed,
            vec![Some("Files(1)".to_string()), Some("Files(2)".to_string())]
        );
    }

    #[test]
    fn add_link_keeps_linked_targets() {
        let (session, transport) = session_with(MockSetup::default());
        folder_with_files(&transport);
        let folder = session.container().entity_set("Folders").unwrap().by_key(1).unwrap();
        let added = session.container().create("Files").unwrap();
        folder.add_link("Files", &added).unwrap();

        let files = folder.navigate_collection("Files").unwrap();
        assert_eq!(files.len(), 3);
        assert!(files.get(2).unwrap().same_entity(&added));
        assert!(folder.entity().read().link_changes["Files"].removed().is_empty());
        assert_eq!(transport.fetches().len(), 2);
    }

    #[test]
    fn add_link_cancels_a_pending_removal() {
        let (session, transport) = session_with(MockSetup::default());
        folder_with_files(&transport);
        let folder = session.container().entity_set("Folders").unwrap().by_key(1).unwrap();
        let first = folder.navigate_collection("Files").unwrap().get(0).unwrap();
        folder.set_links("Files", Vec::<&EntityHandle>::new()).unwrap();
        folder.add_link("Files", &first).unwrap();

        let files = folder.navigate_collection("Files").unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains(&first));
    }

    #[test]
    fn deferred_navigation_is_fetched_once() {
        let (session, transport) = session_with(MockSetup::default());
        let file = WireEntity::new("Docs.File")
            .with_id("Files(3)")
            .with_property("Id", json!(3))
            .with_link("Parent", WireLink::Deferred("Files(3)/Parent".into()));
        transport.set_entity("Files(3)", file);
        transport.set_entity("Files(3)/Parent", folder_wire(1, "Projects"));

        let file = session.container().entity_set("Files").unwrap().by_key(3).unwrap();
        let first = file.navigate("Parent").unwrap().unwrap();
        let second = file.navigate("Parent").unwrap().unwrap();
        assert!(first.same_entity(&second));
        let parent_fetches = transport
            .fetches()
            .iter()
            .filter(|uri| uri.as_str() == "Files(3)/Parent")
            .count();
        assert_eq!(parent_fetches, 1);
    }

    #[test]
    fn inline_navigation_needs_no_fetch() {
        let (session, transport) = session_with(MockSetup::default());
        let file = WireEntity::new("Docs.File")
            .with_id("Files(3)")
            .with_property("Id", json!(3))
            .with_property("Parent", json!({"@odata.id": "Folders(1)", "Id": 1, "Name": "P"}));
        transport.set_entity("Files(3)", file);

        let file = session.container().entity_set("Files").unwrap().by_key(3).unwrap();
        let parent = file.navigate("Parent").unwrap().unwrap();
        assert_eq!(parent.address().as_deref(), Some("Folders(1)"));
        assert_eq!(transport.fetches(), vec!["Files(3)".to_string()]);
    }

    #[test]
    fn linking_wrong_type_is_illegal() {
        let (session, _) = session_with(MockSetup::default());
        let files = session.container().entity_set("Files").unwrap();
        let a = files.create().unwrap();
        let b = files.create().unwrap();
        assert!(matches!(
            a.set_link("Parent", Some(&b)),
            Err(CoreError::IllegalArgument { .. })
        ));
    }

    #[test]
    fn link_targets_are_attached_as_linked() {
        let (session, transport) = session_with(MockSetup::default());
        transport.set_entity("Folders(1)", folder_wire(1, "Projects"));
        let folder = session.container().entity_set("Folders").unwrap().by_key(1).unwrap();
        let file = session.container().entity_set("Files").unwrap().create().unwrap();

        file.set_link("Parent", Some(&folder)).unwrap();
        assert_eq!(folder.status().unwrap(), EntityStatus::Linked);
        assert_eq!(file.status().unwrap(), EntityStatus::New);
    }

    #[test]
    fn deleting_new_entity_drops_it() {
        let (session, _) = session_with(MockSetup::default());
        let file = session.container().entity_set("Files").unwrap().create().unwrap();
        file.delete().unwrap();
        assert!(!file.is_attached());
        assert!(matches!(file.get("Name"), Err(CoreError::Removed { .. })));
    }

    #[test]
    fn streams_read_pending_payload_first() {
        let (session, transport) = session_with(MockSetup::default());
        let photo = WireEntity::new("Docs.Photo")
            .with_id("Photos(1)")
            .with_property("Id", json!(1));
        transport.set_entity("Photos(1)", photo);
        transport.set_stream("Photos(1)/$value", StreamPayload::new("image/png", vec![1u8, 2]));

        let photo = session.container().entity_set("Photos").unwrap().by_key(1).unwrap();
        assert_eq!(photo.get_media().unwrap().len(), 2);
        photo
            .set_stream("Thumbnail", StreamPayload::new("image/png", vec![9u8]))
            .unwrap();
        assert_eq!(photo.get_stream("Thumbnail").unwrap().bytes.as_ref(), &[9u8]);
        assert_eq!(photo.status().unwrap(), EntityStatus::Changed);
        assert!(matches!(
            photo.get_stream("Missing"),
            Err(CoreError::IllegalArgument { .. })
        ));
    }

    #[test]
    fn refresh_discards_caches_but_keeps_edits() {
        let (session, transport) = session_with(MockSetup::default());
        transport.set_entity("Folders(1)", folder_wire(1, "Projects"));
        let folder = session.container().entity_set("Folders").unwrap().by_key(1).unwrap();
        assert_eq!(folder.get("Name").unwrap(), Value::from("Projects"));

        transport.set_entity("Folders(1)", folder_wire(1, "Renamed").with_etag("W/\"2\""));
        folder.set("Location", Value::Null).unwrap();
        folder.refresh().unwrap();
        assert_eq!(folder.get("Name").unwrap(), Value::from("Renamed"));
        assert_eq!(folder.etag().as_deref(), Some("W/\"2\""));
        assert_eq!(folder.changed_properties(), vec!["Location".to_string()]);
    }

    proptest! {
        #[test]
        fn repeated_reads_are_idempotent(name in "[a-zA-Z ]{0,16}", reads in 1usize..5) {
            let (session, transport) = session_with(MockSetup::default());
            transport.set_entity("Folders(1)", folder_wire(1, &name));
            let folder = session.container().entity_set("Folders").unwrap().by_key(1).unwrap();
            for _ in 0..reads {
                prop_assert_eq!(folder.get("Name").unwrap(), Value::from(name.as_str()));
            }
            prop_assert!(folder.changed_properties().is_empty());
            prop_assert_eq!(folder.status().unwrap(), EntityStatus::Attached);
        }

        #[test]
        fn setters_keep_new_entities_new(values in proptest::collection::vec("[a-z]{1,8}", 1..4)) {
            let (session, _) = session_with(MockSetup::default());
            let folder = session.container().entity_set("Folders").unwrap().create().unwrap();
            for value in &values {
                folder.set("Name", value.as_str()).unwrap();
            }
            prop_assert_eq!(folder.status().unwrap(), EntityStatus::New);
        }
    }

    #[test]
    fn handles_are_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<EntityHandle>();
        check::<MockTransport>();
    }
}
