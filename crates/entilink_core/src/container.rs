//! Root container: entity sets, singletons and local creation.

use crate::collection::CollectionHandle;
use crate::entity::EntityHandle;
use crate::error::{CoreError, CoreResult};
use crate::session::SessionInner;
use crate::types::EntityStatus;
use entilink_codec::Value;
use std::sync::Arc;
use tracing::debug;

/// Entry point to the service's top-level resources.
#[derive(Clone)]
pub struct RootContainer {
    session: Arc<SessionInner>,
}

impl RootContainer {
    pub(crate) fn new(session: Arc<SessionInner>) -> Self {
        Self { session }
    }

    /// Starts a query over a top-level entity set.
    pub fn entity_set(&self, name: &str) -> CoreResult<EntitySetQuery> {
        let ty = self.session.metadata.entity_set_type(name)?;
        Ok(EntitySetQuery {
            session: Arc::clone(&self.session),
            set: name.to_string(),
            type_name: ty.name.clone(),
            filter: None,
            order_by: Vec::new(),
            top: None,
            skip: None,
            select: Vec::new(),
            expand: Vec::new(),
        })
    }

    /// Returns a singleton, fetching it on first use.
    ///
    /// The same handle is returned for the life of the session.
    pub fn singleton(&self, name: &str) -> CoreResult<EntityHandle> {
        self.session.metadata.singleton_type(name)?;
        let mut singletons = self.session.singletons.lock();
        if let Some(entity) = singletons.get(name) {
            return Ok(EntityHandle::new(Arc::clone(&self.session), Arc::clone(entity)));
        }

        debug!(singleton = name, "fetching singleton");
        let mut wire = self
            .session
            .transport
            .fetch_entity(name)?
            .ok_or_else(|| CoreError::not_found(format!("singleton {name}")))?;
        wire.id.get_or_insert_with(|| name.to_string());
        let entity = self.session.materialize(wire, name)?;
        singletons.insert(name.to_string(), Arc::clone(&entity));
        Ok(EntityHandle::new(Arc::clone(&self.session), entity))
    }

    /// Creates a new entity in a top-level entity set.
    pub fn create(&self, entity_set: &str) -> CoreResult<EntityHandle> {
        self.entity_set(entity_set)?.create()
    }

    /// Creates an empty ad-hoc collection, e.g. to collect link targets.
    pub fn new_collection(&self, item_type: &str) -> CoreResult<CollectionHandle> {
        self.session.metadata.entity_type(item_type)?;
        Ok(CollectionHandle::new(
            Arc::clone(&self.session),
            Vec::new(),
            None,
            item_type,
        ))
    }
}

/// A query over one entity set.
#[derive(Clone)]
pub struct EntitySetQuery {
    session: Arc<SessionInner>,
    set: String,
    type_name: String,
    filter: Option<String>,
    order_by: Vec<String>,
    top: Option<usize>,
    skip: Option<usize>,
    select: Vec<String>,
    expand: Vec<String>,
}

impl EntitySetQuery {
    /// Entity set name.
    pub fn name(&self) -> &str {
        &self.set
    }

    /// Qualified type of the set's entities.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Restricts results with a filter expression.
    #[must_use]
    pub fn filter(mut self, expression: impl Into<String>) -> Self {
        self.filter = Some(expression.into());
        self
    }

    /// Adds an ordering clause, e.g. `Name desc`.
    #[must_use]
    pub fn order_by(mut self, clause: impl Into<String>) -> Self {
        self.order_by.push(clause.into());
        self
    }

    /// Limits the number of results.
    #[must_use]
    pub fn top(mut self, count: usize) -> Self {
        self.top = Some(count);
        self
    }

    /// Skips leading results.
    #[must_use]
    pub fn skip(mut self, count: usize) -> Self {
        self.skip = Some(count);
        self
    }

    /// Restricts the returned properties.
    #[must_use]
    pub fn select(mut self, property: impl Into<String>) -> Self {
        self.select.push(property.into());
        self
    }

    /// Inlines a navigation property in the results.
    #[must_use]
    pub fn expand(mut self, navigation: impl Into<String>) -> Self {
        self.expand.push(navigation.into());
        self
    }

    /// Request address including query options.
    pub fn uri(&self) -> String {
        let mut options = Vec::new();
        if let Some(filter) = &self.filter {
            options.push(format!("$filter={filter}"));
        }
        if !self.order_by.is_empty() {
            options.push(format!("$orderby={}", self.order_by.join(",")));
        }
        if let Some(top) = self.top {
            options.push(format!("$top={top}"));
        }
        if let Some(skip) = self.skip {
            options.push(format!("$skip={skip}"));
        }
        if !self.select.is_empty() {
            options.push(format!("$select={}", self.select.join(",")));
        }
        if !self.expand.is_empty() {
            options.push(format!("$expand={}", self.expand.join(",")));
        }

        if options.is_empty() {
            self.set.clone()
        } else {
            format!("{}?{}", self.set, options.join("&"))
        }
    }

    /// Runs the query.
    ///
    /// The returned collection is backed by the entity set address, so
    /// operations bound to the set can be invoked on it.
    pub fn execute(&self) -> CoreResult<CollectionHandle> {
        let ty = self.session.metadata.entity_type(&self.type_name)?;
        for navigation in &self.expand {
            ty.navigation_property(navigation)?;
        }
        for property in &self.select {
            ty.property_type(property)?;
        }

        let uri = self.uri();
        debug!(%uri, "executing query");
        let items = self
            .session
            .transport
            .fetch_collection(&uri)?
            .into_iter()
            .map(|wire| self.session.materialize(wire, &self.set))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(CollectionHandle::new(
            Arc::clone(&self.session),
            items,
            Some(self.set.clone()),
            self.type_name.clone(),
        ))
    }

    /// Fetches one entity by key.
    pub fn by_key(&self, key: impl Into<Value>) -> CoreResult<EntityHandle> {
        let key = key.into();
        let literal = key
            .to_key_literal()
            .ok_or_else(|| CoreError::illegal_argument(format!("{key} cannot be used as a key")))?;
        let uri = format!("{}({literal})", self.set);
        let wire = self
            .session
            .transport
            .fetch_entity(&uri)?
            .ok_or_else(|| CoreError::not_found(uri.clone()))?;
        let entity = self.session.materialize(wire, &self.set)?;
        Ok(EntityHandle::new(Arc::clone(&self.session), entity))
    }

    /// Creates a new entity in this set. It is tracked as `NEW`.
    pub fn create(&self) -> CoreResult<EntityHandle> {
        let entity = self.session.new_entity(&self.set, &self.type_name);
        self.session
            .registry
            .lock()
            .attach(&entity, EntityStatus::New);
        debug!(handle = %entity.id(), set = %self.set, "created local entity");
        Ok(EntityHandle::new(Arc::clone(&self.session), entity))
    }
}
