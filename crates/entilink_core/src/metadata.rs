//! Service metadata: entity types, entity sets and singletons.
//!
//! Metadata is supplied by the caller (typically generated from the
//! service's `$metadata` document) and is read-only for the life of a
//! session.

use crate::error::{CoreError, CoreResult};
use entilink_codec::{ComplexType, TypeDescriptor};
use entilink_protocol::Cardinality;
use std::collections::{BTreeMap, BTreeSet};

/// A navigation property of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationProperty {
    /// Property name.
    pub name: String,
    /// Qualified name of the target entity type.
    pub target_type: String,
    /// Single or collection valued.
    pub cardinality: Cardinality,
    /// Entity set holding the targets, when bound explicitly.
    pub target_set: Option<String>,
}

/// Description of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTypeDescriptor {
    /// Qualified type name.
    pub name: String,
    /// Key property names, in key order.
    pub keys: Vec<String>,
    /// Structural properties.
    pub properties: BTreeMap<String, TypeDescriptor>,
    /// Navigation properties.
    pub navigations: BTreeMap<String, NavigationProperty>,
    /// Whether the type is a media entity with its own binary content.
    pub has_stream: bool,
    /// Named stream properties.
    pub streams: BTreeSet<String>,
    /// Operations bound to collections of this type.
    pub bound_operations: BTreeSet<String>,
}

impl EntityTypeDescriptor {
    /// Creates a type without members.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            properties: BTreeMap::new(),
            navigations: BTreeMap::new(),
            has_stream: false,
            streams: BTreeSet::new(),
            bound_operations: BTreeSet::new(),
        }
    }

    /// Adds a key property.
    #[must_use]
    pub fn key(mut self, name: impl Into<String>, ty: impl Into<TypeDescriptor>) -> Self {
        let name = name.into();
        self.keys.push(name.clone());
        self.properties.insert(name, ty.into());
        self
    }

    /// Adds a structural property.
    #[must_use]
    pub fn property(mut self, name: impl Into<String>, ty: impl Into<TypeDescriptor>) -> Self {
        self.properties.insert(name.into(), ty.into());
        self
    }

    /// Adds a navigation property whose targets live in the type's default set.
    #[must_use]
    pub fn navigation(
        self,
        name: impl Into<String>,
        target_type: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        self.push_navigation(name.into(), target_type.into(), cardinality, None)
    }

    /// Adds a navigation property bound to an explicit target set.
    #[must_use]
    pub fn navigation_in(
        self,
        name: impl Into<String>,
        target_type: impl Into<String>,
        cardinality: Cardinality,
        target_set: impl Into<String>,
    ) -> Self {
        self.push_navigation(
            name.into(),
            target_type.into(),
            cardinality,
            Some(target_set.into()),
        )
    }

    fn push_navigation(
        mut self,
        name: String,
        target_type: String,
        cardinality: Cardinality,
        target_set: Option<String>,
    ) -> Self {
        self.navigations.insert(
            name.clone(),
            NavigationProperty {
                name,
                target_type,
                cardinality,
                target_set,
            },
        );
        self
    }

    /// Marks the type as a media entity.
    #[must_use]
    pub fn media(mut self) -> Self {
        self.has_stream = true;
        self
    }

    /// Adds a named stream property.
    #[must_use]
    pub fn stream(mut self, name: impl Into<String>) -> Self {
        self.streams.insert(name.into());
        self
    }

    /// Declares an operation bound to collections of this type.
    #[must_use]
    pub fn bound_operation(mut self, name: impl Into<String>) -> Self {
        self.bound_operations.insert(name.into());
        self
    }

    /// Looks up a structural property.
    pub fn property_type(&self, name: &str) -> CoreResult<&TypeDescriptor> {
        self.properties.get(name).ok_or_else(|| {
            CoreError::illegal_argument(format!("{} has no property {name}", self.name))
        })
    }

    /// Looks up a navigation property.
    pub fn navigation_property(&self, name: &str) -> CoreResult<&NavigationProperty> {
        self.navigations.get(name).ok_or_else(|| {
            CoreError::illegal_argument(format!("{} has no navigation property {name}", self.name))
        })
    }

    /// Names of all navigation properties.
    pub fn navigation_names(&self) -> impl Iterator<Item = &str> {
        self.navigations.keys().map(String::as_str)
    }

    /// Fails unless `name` is a declared stream property.
    pub fn check_stream(&self, name: &str) -> CoreResult<()> {
        if self.streams.contains(name) {
            Ok(())
        } else {
            Err(CoreError::illegal_argument(format!(
                "{} has no stream property {name}",
                self.name
            )))
        }
    }
}

/// Metadata of one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMetadata {
    /// Schema namespace.
    pub schema: String,
    /// Entity container name.
    pub container: String,
    entity_types: BTreeMap<String, EntityTypeDescriptor>,
    complex_types: BTreeMap<String, ComplexType>,
    entity_sets: BTreeMap<String, String>,
    singletons: BTreeMap<String, String>,
}

impl ServiceMetadata {
    /// Creates empty metadata.
    pub fn new(schema: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            container: container.into(),
            ..Self::default()
        }
    }

    /// Registers an entity type.
    #[must_use]
    pub fn with_entity_type(mut self, ty: EntityTypeDescriptor) -> Self {
        self.entity_types.insert(ty.name.clone(), ty);
        self
    }

    /// Registers a complex type.
    #[must_use]
    pub fn with_complex_type(mut self, ty: ComplexType) -> Self {
        self.complex_types.insert(ty.name.clone(), ty);
        self
    }

    /// Registers an entity set.
    #[must_use]
    pub fn with_entity_set(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.entity_sets.insert(name.into(), type_name.into());
        self
    }

    /// Registers a singleton.
    #[must_use]
    pub fn with_singleton(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.singletons.insert(name.into(), type_name.into());
        self
    }

    /// Looks up an entity type.
    pub fn entity_type(&self, name: &str) -> CoreResult<&EntityTypeDescriptor> {
        self.entity_types
            .get(name)
            .ok_or_else(|| CoreError::not_found(format!("entity type {name}")))
    }

    /// Returns true if the entity type is declared.
    pub fn has_entity_type(&self, name: &str) -> bool {
        self.entity_types.contains_key(name)
    }

    /// Type of the entities in a set.
    pub fn entity_set_type(&self, set: &str) -> CoreResult<&EntityTypeDescriptor> {
        let type_name = self
            .entity_sets
            .get(set)
            .ok_or_else(|| CoreError::not_found(format!("entity set {set}")))?;
        self.entity_type(type_name)
    }

    /// Type of a singleton.
    pub fn singleton_type(&self, name: &str) -> CoreResult<&EntityTypeDescriptor> {
        let type_name = self
            .singletons
            .get(name)
            .ok_or_else(|| CoreError::not_found(format!("singleton {name}")))?;
        self.entity_type(type_name)
    }

    /// Returns true if `name` is a singleton.
    pub fn is_singleton(&self, name: &str) -> bool {
        self.singletons.contains_key(name)
    }

    /// First entity set holding entities of the given type.
    pub fn set_for_type(&self, type_name: &str) -> Option<&str> {
        self.entity_sets
            .iter()
            .find(|(_, t)| t.as_str() == type_name)
            .map(|(set, _)| set.as_str())
    }

    /// Entity set holding the targets of a navigation property.
    pub fn target_set(&self, navigation: &NavigationProperty) -> CoreResult<String> {
        navigation
            .target_set
            .clone()
            .or_else(|| self.set_for_type(&navigation.target_type).map(str::to_string))
            .ok_or_else(|| {
                CoreError::not_found(format!("entity set for type {}", navigation.target_type))
            })
    }

    /// Resolves a type expression such as `Collection(Docs.Location)`.
    pub fn resolve_type(&self, expression: &str) -> CoreResult<TypeDescriptor> {
        Ok(TypeDescriptor::parse_with(expression, |name| {
            self.complex_types.get(name).cloned()
        })?)
    }

    /// Names of all entity sets.
    pub fn entity_sets(&self) -> impl Iterator<Item = &str> {
        self.entity_sets.keys().map(String::as_str)
    }
}
