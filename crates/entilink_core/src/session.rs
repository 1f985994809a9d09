//! Session: the explicit context every handle operates in.
//!
//! A session owns the entity registry, the identity map used to
//! deduplicate materialized entities, the singleton cache and the
//! collaborators (transport, codec, metadata). Handles keep the session
//! alive; entity cells never point back at it.

use crate::commit::{self, FlushReport, SessionStats};
use crate::config::{CommitMode, SessionConfig};
use crate::container::RootContainer;
use crate::entity::{EntityCell, EntityHandle, EntityRef, EntityState};
use crate::error::{CoreError, CoreResult};
use crate::identity::{key_from_address, key_literal, EntityIdentity};
use crate::metadata::ServiceMetadata;
use crate::registry::EntityRegistry;
use crate::transport::Transport;
use crate::types::{EntityStatus, HandleId};
use entilink_codec::{JsonCodec, PrimitiveCodec};
use entilink_protocol::WireEntity;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Shared state behind a [`Session`].
pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    pub(crate) metadata: Arc<ServiceMetadata>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) codec: Arc<dyn PrimitiveCodec>,
    pub(crate) registry: Mutex<EntityRegistry>,
    pub(crate) singletons: Mutex<HashMap<String, EntityRef>>,
    pub(crate) flush_lock: Mutex<()>,
    pub(crate) stats: RwLock<SessionStats>,
    identities: Mutex<HashMap<EntityIdentity, Weak<EntityCell>>>,
    next_handle: AtomicU64,
}

impl SessionInner {
    fn next_id(&self) -> HandleId {
        HandleId::new(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    /// Routes an accessor through the registry.
    ///
    /// Attaches the entity on first use (`ATTACHED` if durable, `NEW`
    /// otherwise) and applies the setter transition when `edit` is set.
    /// Returns the registry's canonical entity.
    pub(crate) fn track(&self, entity: &EntityRef, edit: bool) -> CoreResult<EntityRef> {
        entity.check_live()?;
        let durable = entity.read().address.is_some();
        let mut registry = self.registry.lock();
        let status = if durable {
            EntityStatus::Attached
        } else {
            EntityStatus::New
        };
        let canonical = registry.attach(entity, status);
        if edit {
            registry.mark_edited(&canonical)?;
        }
        Ok(canonical)
    }

    /// Attaches a navigation target: `LINKED` if durable, `NEW` otherwise.
    pub(crate) fn track_target(&self, entity: &EntityRef) -> CoreResult<EntityRef> {
        entity.check_live()?;
        let durable = entity.read().address.is_some();
        let status = if durable {
            EntityStatus::Linked
        } else {
            EntityStatus::New
        };
        Ok(self.registry.lock().attach(entity, status))
    }

    /// Creates a local entity with no server key.
    pub(crate) fn new_entity(&self, entity_set: &str, type_name: &str) -> EntityRef {
        let identity = EntityIdentity::new(
            self.metadata.schema.clone(),
            self.metadata.container.clone(),
            entity_set,
            type_name,
            None,
        );
        EntityCell::new(self.next_id(), EntityState::new(identity, None, None))
    }

    /// Turns a fetched wire entity into an entity cell.
    ///
    /// Keyed entities go through the identity map, so the same record
    /// reached twice yields the same cell. The cell is not attached until
    /// one of its accessors is used.
    pub(crate) fn materialize(&self, mut wire: WireEntity, entity_set: &str) -> CoreResult<EntityRef> {
        let set_type = if self.metadata.is_singleton(entity_set) {
            self.metadata.singleton_type(entity_set)?
        } else {
            self.metadata.entity_set_type(entity_set)?
        };
        let type_name = match &wire.type_name {
            Some(declared) if self.metadata.has_entity_type(declared) => declared.clone(),
            _ => set_type.name.clone(),
        };
        self.prepare_wire(&mut wire, &type_name)?;

        let key = self
            .key_of(&wire, &type_name)?
            .or_else(|| wire.id.as_deref().and_then(key_from_address));
        let address = wire
            .id
            .clone()
            .or_else(|| key.as_ref().map(|k| format!("{entity_set}({k})")));
        let identity = EntityIdentity::new(
            self.metadata.schema.clone(),
            self.metadata.container.clone(),
            entity_set,
            type_name,
            key,
        );

        if !identity.is_keyed() {
            return Ok(EntityCell::new(
                self.next_id(),
                EntityState::new(identity, address, Some(wire)),
            ));
        }

        let mut identities = self.identities.lock();
        if let Some(existing) = identities.get(&identity).and_then(Weak::upgrade) {
            debug!(handle = %existing.id(), %identity, "reusing materialized entity");
            return Ok(existing);
        }
        let entity = EntityCell::new(
            self.next_id(),
            EntityState::new(identity.clone(), address, Some(wire)),
        );
        identities.insert(identity, Arc::downgrade(&entity));
        Ok(entity)
    }

    /// Moves expanded navigation data out of the structural properties.
    pub(crate) fn prepare_wire(&self, wire: &mut WireEntity, type_name: &str) -> CoreResult<()> {
        let ty = self.metadata.entity_type(type_name)?;
        wire.promote_inline_links(ty.navigation_names())?;
        Ok(())
    }

    /// Key literal from the key properties of a wire entity.
    pub(crate) fn key_of(&self, wire: &WireEntity, type_name: &str) -> CoreResult<Option<String>> {
        let ty = self.metadata.entity_type(type_name)?;
        let mut parts = Vec::with_capacity(ty.keys.len());
        for name in &ty.keys {
            let Some(raw) = wire.property(name) else {
                return Ok(None);
            };
            let value = self.codec.decode(raw, ty.property_type(name)?)?;
            parts.push((name.as_str(), value));
        }
        Ok(key_literal(&parts))
    }

    /// Makes a newly keyed entity reachable through the identity map.
    pub(crate) fn remember(&self, entity: &EntityRef) {
        let identity = entity.identity();
        if identity.is_keyed() {
            self.identities.lock().insert(identity, Arc::downgrade(entity));
        }
    }
}

/// A change-tracking session against one service.
///
/// Cloning a session is cheap; clones share the same registry.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Creates a session using the OData JSON codec.
    pub fn new(
        config: SessionConfig,
        metadata: ServiceMetadata,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_codec(config, metadata, transport, Arc::new(JsonCodec))
    }

    /// Creates a session with a custom value codec.
    pub fn with_codec(
        config: SessionConfig,
        metadata: ServiceMetadata,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn PrimitiveCodec>,
    ) -> Self {
        info!(
            service_root = %config.service_root,
            mode = config.commit_mode.as_str(),
            "opening session"
        );
        Self {
            inner: Arc::new(SessionInner {
                config,
                metadata: Arc::new(metadata),
                transport,
                codec,
                registry: Mutex::new(EntityRegistry::new()),
                singletons: Mutex::new(HashMap::new()),
                flush_lock: Mutex::new(()),
                stats: RwLock::new(SessionStats::default()),
                identities: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    /// Entry point to entity sets and singletons.
    pub fn container(&self) -> RootContainer {
        RootContainer::new(Arc::clone(&self.inner))
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Service metadata.
    pub fn metadata(&self) -> &ServiceMetadata {
        &self.inner.metadata
    }

    /// Commits every pending edit using the configured mode.
    pub fn flush(&self) -> CoreResult<FlushReport> {
        self.flush_with(self.inner.config.commit_mode)
    }

    /// Commits every pending edit using the given mode.
    ///
    /// Flushes are serialized: a second caller waits for the first.
    pub fn flush_with(&self, mode: CommitMode) -> CoreResult<FlushReport> {
        commit::flush(&self.inner, mode)
    }

    /// Statistics accumulated across flushes.
    pub fn stats(&self) -> SessionStats {
        self.inner.stats.read().clone()
    }

    fn own(&self, handle: &EntityHandle) -> CoreResult<()> {
        if Arc::ptr_eq(&self.inner, handle.session()) {
            Ok(())
        } else {
            Err(CoreError::illegal_argument(
                "handle belongs to another session",
            ))
        }
    }

    /// Tracks a handle with an explicit status.
    ///
    /// If a handle with an equal identity is already tracked, that handle
    /// is returned instead and keeps its status.
    pub fn attach(&self, handle: &EntityHandle, status: EntityStatus) -> CoreResult<EntityHandle> {
        self.own(handle)?;
        handle.entity().check_live()?;
        let canonical = self.inner.registry.lock().attach(handle.entity(), status);
        Ok(EntityHandle::new(Arc::clone(&self.inner), canonical))
    }

    /// Registry status of a handle.
    pub fn status(&self, handle: &EntityHandle) -> CoreResult<EntityStatus> {
        self.own(handle)?;
        self.inner.registry.lock().status(handle.entity())
    }

    /// Overrides the registry status of a tracked handle.
    pub fn set_status(&self, handle: &EntityHandle, status: EntityStatus) -> CoreResult<()> {
        self.own(handle)?;
        self.inner.registry.lock().set_status(handle.entity(), status)
    }

    /// Returns true if the registry tracks the handle.
    pub fn is_attached(&self, handle: &EntityHandle) -> bool {
        Arc::ptr_eq(&self.inner, handle.session())
            && self.inner.registry.lock().is_attached(handle.entity())
    }

    /// Snapshot of tracked handles in attach order.
    pub fn tracked(&self) -> Vec<(EntityHandle, EntityStatus)> {
        self.inner
            .registry
            .lock()
            .iterate()
            .into_iter()
            .map(|(entity, status)| (EntityHandle::new(Arc::clone(&self.inner), entity), status))
            .collect()
    }

    /// Number of tracked handles.
    pub fn tracked_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Stops tracking every handle. Pending edits stay on the handles.
    pub fn detach_all(&self) {
        self.inner.registry.lock().detach_all();
    }

    /// Returns true if a flush would send anything.
    pub fn has_pending_changes(&self) -> bool {
        let tracked = self.inner.registry.lock().iterate();
        tracked
            .iter()
            .any(|(entity, status)| status.is_dirty() || entity.read().has_pending_edits())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("service_root", &self.inner.config.service_root)
            .field("commit_mode", &self.inner.config.commit_mode)
            .field("tracked", &self.tracked_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::metadata::EntityTypeDescriptor;
    use crate::transport::MockTransport;
    use entilink_codec::{ComplexType, PrimitiveKind, TypeDescriptor};
    use entilink_protocol::Cardinality;
    use serde_json::json;

    /// Options for [`session_with`].
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct MockSetup {
        pub(crate) mode: CommitMode,
        pub(crate) use_etags: bool,
    }

    impl Default for MockSetup {
        fn default() -> Self {
            Self {
                mode: CommitMode::Batched,
                use_etags: true,
            }
        }
    }

    /// Same schema as `entilink_testkit::docs_metadata`. The testkit
    /// depends on this crate, so unit tests here keep their own copy.
    pub(crate) fn docs_metadata() -> ServiceMetadata {
        let location = ComplexType::new("Docs.Location")
            .field("Floor", PrimitiveKind::Int16.into())
            .field("Room", PrimitiveKind::String.into());
        ServiceMetadata::new("Docs", "DocsService")
            .with_complex_type(location.clone())
            .with_entity_type(
                EntityTypeDescriptor::new("Docs.Folder")
                    .key("Id", PrimitiveKind::Int32)
                    .property("Name", PrimitiveKind::String)
                    .property("Location", TypeDescriptor::Complex(location))
                    .navigation("Files", "Docs.File", Cardinality::Collection)
                    .navigation("Parent", "Docs.Folder", Cardinality::Single)
                    .navigation("Cover", "Docs.File", Cardinality::Single)
                    .bound_operation("Archive"),
            )
            .with_entity_type(
                EntityTypeDescriptor::new("Docs.File")
                    .key("Id", PrimitiveKind::Int32)
                    .property("Name", PrimitiveKind::String)
                    .property("Size", PrimitiveKind::Int64)
                    .navigation("Parent", "Docs.Folder", Cardinality::Single)
                    .navigation("Related", "Docs.File", Cardinality::Single)
                    .bound_operation("Compress"),
            )
            .with_entity_type(
                EntityTypeDescriptor::new("Docs.Photo")
                    .key("Id", PrimitiveKind::Int32)
                    .property("Caption", PrimitiveKind::String)
                    .media()
                    .stream("Thumbnail"),
            )
            .with_entity_type(
                EntityTypeDescriptor::new("Docs.Settings")
                    .key("Id", PrimitiveKind::Int32)
                    .property("Theme", PrimitiveKind::String),
            )
            .with_entity_set("Folders", "Docs.Folder")
            .with_entity_set("Files", "Docs.File")
            .with_entity_set("Photos", "Docs.Photo")
            .with_singleton("Settings", "Docs.Settings")
    }

    pub(crate) fn session_with(setup: MockSetup) -> (Session, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let config = SessionConfig::new("https://docs.example.com/odata")
            .with_commit_mode(setup.mode)
            .with_etags(setup.use_etags);
        let session = Session::new(config, docs_metadata(), transport.clone());
        (session, transport)
    }

    pub(crate) fn folder_wire(id: i64, name: &str) -> WireEntity {
        WireEntity::new("Docs.Folder")
            .with_id(format!("Folders({id})"))
            .with_etag("W/\"1\"")
            .with_property("Id", json!(id))
            .with_property("Name", json!(name))
    }

    pub(crate) fn file_wire(id: i64, name: &str) -> WireEntity {
        WireEntity::new("Docs.File")
            .with_id(format!("Files({id})"))
            .with_etag("W/\"1\"")
            .with_property("Id", json!(id))
            .with_property("Name", json!(name))
    }
}
