//! Collection handles.

use crate::entity::{EntityHandle, EntityRef};
use crate::error::{CoreError, CoreResult};
use crate::session::SessionInner;
use serde_json::Value as Json;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A list of entity handles returned by a query or a navigation.
///
/// List operations only touch the local list. To change what a navigation
/// property points to, pass the handles to
/// [`EntityHandle::set_links`] or [`EntityHandle::add_link`].
#[derive(Clone)]
pub struct CollectionHandle {
    session: Arc<SessionInner>,
    items: Vec<EntityRef>,
    uri: Option<String>,
    item_type: String,
}

impl CollectionHandle {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        items: Vec<EntityRef>,
        uri: Option<String>,
        item_type: impl Into<String>,
    ) -> Self {
        Self {
            session,
            items,
            uri,
            item_type: item_type.into(),
        }
    }

    /// Backing address, absent for ad-hoc and uncommitted collections.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Qualified type name of the items.
    pub fn item_type(&self) -> &str {
        &self.item_type
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if there are no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item at `index`.
    pub fn get(&self, index: usize) -> Option<EntityHandle> {
        self.items.get(index).map(|e| self.handle(e))
    }

    /// Iterates over the items.
    pub fn iter(&self) -> impl Iterator<Item = EntityHandle> + '_ {
        self.items.iter().map(|e| self.handle(e))
    }

    /// All items as handles.
    pub fn handles(&self) -> Vec<EntityHandle> {
        self.iter().collect()
    }

    /// Returns true if the collection holds `entity`.
    pub fn contains(&self, entity: &EntityHandle) -> bool {
        self.position(entity).is_some()
    }

    /// Appends an item.
    pub fn add(&mut self, entity: &EntityHandle) -> CoreResult<()> {
        if entity.type_name() != self.item_type {
            return Err(CoreError::illegal_argument(format!(
                "collection of {} cannot hold {}",
                self.item_type,
                entity.type_name()
            )));
        }
        self.items.push(Arc::clone(entity.entity()));
        Ok(())
    }

    /// Appends every item; fails without changes if any has the wrong type.
    pub fn add_all<'a>(
        &mut self,
        entities: impl IntoIterator<Item = &'a EntityHandle>,
    ) -> CoreResult<()> {
        let entities: Vec<&EntityHandle> = entities.into_iter().collect();
        if let Some(wrong) = entities.iter().find(|e| e.type_name() != self.item_type) {
            return Err(CoreError::illegal_argument(format!(
                "collection of {} cannot hold {}",
                self.item_type,
                wrong.type_name()
            )));
        }
        self.items
            .extend(entities.into_iter().map(|e| Arc::clone(e.entity())));
        Ok(())
    }

    /// Removes the first occurrence of `entity`.
    pub fn remove(&mut self, entity: &EntityHandle) -> bool {
        match self.position(entity) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Removes every listed item; returns how many were removed.
    pub fn remove_all<'a>(&mut self, entities: impl IntoIterator<Item = &'a EntityHandle>) -> usize {
        entities.into_iter().filter(|e| self.remove(e)).count()
    }

    /// Removes all items.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Invokes an operation bound to this collection.
    ///
    /// The collection must have a backing address; ad-hoc collections and
    /// collections of uncommitted entities fail with `NotFlushed`.
    pub fn invoke(&self, operation: &str, parameters: &Json) -> CoreResult<Json> {
        let ty = self.session.metadata.entity_type(&self.item_type)?;
        if !ty.bound_operations.contains(operation) {
            return Err(CoreError::illegal_argument(format!(
                "{operation} is not bound to collections of {}",
                self.item_type
            )));
        }
        let uri = self.uri.as_deref().ok_or(CoreError::NotFlushed)?;
        debug!(uri, operation, "invoking bound operation");
        Ok(self.session.transport.invoke(uri, operation, parameters)?)
    }

    fn handle(&self, entity: &EntityRef) -> EntityHandle {
        EntityHandle::new(Arc::clone(&self.session), Arc::clone(entity))
    }

    fn position(&self, entity: &EntityHandle) -> Option<usize> {
        self.items
            .iter()
            .position(|item| self.handle(item).same_entity(entity))
    }
}

impl fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("item_type", &self.item_type)
            .field("uri", &self.uri)
            .field("len", &self.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::{folder_wire, session_with, MockSetup};
    use serde_json::json;

    #[test]
    fn list_operations_delegate() {
        let (session, _) = session_with(MockSetup::default());
        let files = session.container().entity_set("Files").unwrap();
        let a = files.create().unwrap();
        let b = files.create().unwrap();

        let mut collection = session.container().new_collection("Docs.File").unwrap();
        collection.add_all([&a, &b]).unwrap();
        assert_eq!(collection.len(), 2);
        assert!(collection.contains(&b));
        assert!(collection.remove(&a));
        assert!(!collection.remove(&a));
        assert_eq!(collection.handles().len(), 1);
        collection.clear();
        assert!(collection.is_empty());
    }

    #[test]
    fn wrong_item_type_is_rejected() {
        let (session, _) = session_with(MockSetup::default());
        let folder = session.container().entity_set("Folders").unwrap().create().unwrap();
        let mut collection = session.container().new_collection("Docs.File").unwrap();
        assert!(collection.add(&folder).is_err());
        assert!(collection.add_all([&folder]).is_err());
        assert!(collection.is_empty());
    }

    #[test]
    fn bound_operation_needs_backing_uri() {
        let (session, _) = session_with(MockSetup::default());
        let collection = session.container().new_collection("Docs.File").unwrap();
        assert!(matches!(
            collection.invoke("Compress", &json!({})),
            Err(CoreError::NotFlushed)
        ));
        assert!(matches!(
            collection.invoke("Explode", &json!({})),
            Err(CoreError::IllegalArgument { .. })
        ));
    }

    #[test]
    fn bound_operation_on_queried_collection() {
        let (session, transport) = session_with(MockSetup::default());
        transport.set_collection("Folders", vec![folder_wire(1, "A"), folder_wire(2, "B")]);
        let folders = session.container().entity_set("Folders").unwrap().execute().unwrap();
        assert_eq!(folders.len(), 2);
        assert_eq!(folders.uri(), Some("Folders"));

        let result = folders.invoke("Archive", &json!({"reason": "old"})).unwrap();
        assert_eq!(result["operation"], json!("Archive"));
        assert_eq!(result["uri"], json!("Folders"));
    }
}
