//! Server-side entity state as last seen on the wire.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Navigation data carried by a fetched entity.
#[derive(Debug, Clone, PartialEq)]
pub enum WireLink {
    /// Not inlined; the target must be fetched from this address.
    Deferred(String),
    /// Inlined single target.
    Entity(Box<WireEntity>),
    /// Inlined collection of targets.
    Entities(Vec<WireEntity>),
    /// Inlined empty single-valued navigation.
    Null,
}

/// Media (primary stream) information of a media entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Address of the binary content.
    pub read_link: Option<String>,
    /// Content type of the binary content.
    pub content_type: Option<String>,
    /// Concurrency token of the binary content.
    pub etag: Option<String>,
}

/// An entity as last returned by the service.
///
/// Property values stay in wire form; they are decoded lazily by the
/// change-tracking layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireEntity {
    /// Qualified type name, when the payload carried one.
    pub type_name: Option<String>,
    /// Durable address of the entity, relative to the service root.
    pub id: Option<String>,
    /// Concurrency token.
    pub etag: Option<String>,
    /// Structural properties in wire form.
    pub properties: BTreeMap<String, Json>,
    /// Navigation data by navigation property name.
    pub links: BTreeMap<String, WireLink>,
    /// Primary stream information, for media entities.
    pub media: Option<MediaInfo>,
    /// Read addresses of named stream properties.
    pub stream_links: BTreeMap<String, String>,
}

impl WireEntity {
    /// Creates an empty entity of the given type.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: Some(type_name.into()),
            ..Self::default()
        }
    }

    /// Sets the durable address.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the concurrency token.
    #[must_use]
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Sets a wire property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: Json) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Sets navigation data.
    #[must_use]
    pub fn with_link(mut self, name: impl Into<String>, link: WireLink) -> Self {
        self.links.insert(name.into(), link);
        self
    }

    /// Returns a wire property.
    pub fn property(&self, name: &str) -> Option<&Json> {
        self.properties.get(name)
    }

    /// Returns navigation data.
    pub fn link(&self, name: &str) -> Option<&WireLink> {
        self.links.get(name)
    }

    /// Overwrites wire properties with freshly committed values.
    pub fn merge_properties(&mut self, committed: &BTreeMap<String, Json>) {
        for (name, value) in committed {
            self.properties.insert(name.clone(), value.clone());
        }
    }

    /// Moves inlined navigation targets out of `properties` into `links`.
    ///
    /// JSON payloads cannot distinguish an expanded navigation property from
    /// a complex property without metadata; the caller names the navigation
    /// properties.
    pub fn promote_inline_links<'a>(
        &mut self,
        navigation_names: impl IntoIterator<Item = &'a str>,
    ) -> ProtocolResult<()> {
        for name in navigation_names {
            let Some(raw) = self.properties.remove(name) else {
                continue;
            };
            let link = match raw {
                Json::Null => WireLink::Null,
                Json::Array(items) => WireLink::Entities(
                    items
                        .iter()
                        .map(WireEntity::from_json)
                        .collect::<ProtocolResult<Vec<_>>>()?,
                ),
                object @ Json::Object(_) => WireLink::Entity(Box::new(WireEntity::from_json(&object)?)),
                other => {
                    return Err(ProtocolError::invalid_structure(format!(
                        "navigation property {name} carries a scalar: {other}"
                    )))
                }
            };
            self.links.insert(name.to_string(), link);
        }
        Ok(())
    }
}
