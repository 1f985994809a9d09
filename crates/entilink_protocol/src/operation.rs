//! Outgoing operations.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;

/// Cardinality of a navigation property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    /// At most one target.
    Single,
    /// Any number of targets.
    Collection,
}

/// Reference to a link target inside an outgoing record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkTarget {
    /// Durable address of an existing entity.
    Address(String),
    /// Position of an operation earlier in the same atomic batch.
    Position(u32),
}

impl LinkTarget {
    /// Renders the reference the way it travels on the wire.
    pub fn render(&self) -> String {
        match self {
            LinkTarget::Address(address) => address.clone(),
            LinkTarget::Position(position) => format!("${position}"),
        }
    }
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Link bindings for one navigation property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Cardinality of the navigation property.
    pub cardinality: Cardinality,
    /// Bound targets. Empty on a single-valued property means "unset".
    pub targets: Vec<LinkTarget>,
}

/// Structured body of a create or update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireRecord {
    /// Qualified type name.
    pub type_name: String,
    /// Changed structural properties in wire form.
    pub properties: BTreeMap<String, Json>,
    /// Navigation bindings by property name.
    pub bindings: BTreeMap<String, Binding>,
}

impl WireRecord {
    /// Creates an empty record.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Self::default()
        }
    }

    /// Adds a bound target, creating the binding on first use.
    pub fn bind(&mut self, name: &str, cardinality: Cardinality, target: Option<LinkTarget>) {
        let binding = self
            .bindings
            .entry(name.to_string())
            .or_insert_with(|| Binding {
                cardinality,
                targets: Vec::new(),
            });
        if let Some(target) = target {
            binding.targets.push(target);
        }
    }

    /// Returns true if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.bindings.is_empty()
    }

    /// Batch positions referenced by the bindings.
    pub fn referenced_positions(&self) -> impl Iterator<Item = u32> + '_ {
        self.bindings
            .values()
            .flat_map(|b| b.targets.iter())
            .filter_map(|t| match t {
                LinkTarget::Position(p) => Some(*p),
                LinkTarget::Address(_) => None,
            })
    }
}

/// Binary content of a media entity or a stream property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPayload {
    /// MIME type of the content.
    pub content_type: Option<String>,
    /// The content.
    pub bytes: Bytes,
}

impl StreamPayload {
    /// Creates a payload.
    pub fn new(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            bytes: bytes.into(),
        }
    }

    /// Returns the content length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if there is no content.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Create an entity in a collection.
    Create,
    /// Merge changed properties and bindings into an entity.
    Update,
    /// Delete an entity.
    Delete,
    /// Replace the primary stream of a media entity.
    UpdateMedia,
    /// Replace a named stream property.
    UpdateStream(String),
    /// Remove one target from a collection-valued navigation property.
    Unlink {
        /// Navigation property name.
        navigation: String,
        /// Durable address of the target to remove.
        target: String,
    },
}

impl OperationKind {
    /// HTTP method used for the operation.
    pub fn method(&self) -> &'static str {
        match self {
            OperationKind::Create => "POST",
            OperationKind::Update => "PATCH",
            OperationKind::Delete | OperationKind::Unlink { .. } => "DELETE",
            OperationKind::UpdateMedia | OperationKind::UpdateStream(_) => "PUT",
        }
    }
}

/// The resource an operation is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A collection address (entity set or collection navigation).
    Collection(String),
    /// A durable entity address.
    Address(String),
    /// An entity created earlier in the same atomic batch.
    Position(u32),
}

impl Target {
    /// Renders the target address.
    pub fn render(&self) -> String {
        match self {
            Target::Collection(uri) | Target::Address(uri) => uri.clone(),
            Target::Position(position) => format!("${position}"),
        }
    }
}

/// Request body of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No body.
    Empty,
    /// Structured body.
    Record(WireRecord),
    /// Binary body.
    Binary(StreamPayload),
}

/// One planned request.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Position of the operation in its commit (batch content id).
    pub position: u32,
    /// What to do.
    pub kind: OperationKind,
    /// Where to do it.
    pub target: Target,
    /// Request body.
    pub payload: Payload,
    /// Concurrency token to send as a precondition.
    pub if_match: Option<String>,
}

impl Operation {
    /// Creates an entity in the given collection.
    pub fn create(position: u32, collection: impl Into<String>, record: WireRecord) -> Self {
        Self {
            position,
            kind: OperationKind::Create,
            target: Target::Collection(collection.into()),
            payload: Payload::Record(record),
            if_match: None,
        }
    }

    /// Updates an entity.
    pub fn update(position: u32, target: Target, record: WireRecord) -> Self {
        Self {
            position,
            kind: OperationKind::Update,
            target,
            payload: Payload::Record(record),
            if_match: None,
        }
    }

    /// Deletes an entity.
    pub fn delete(position: u32, target: Target) -> Self {
        Self {
            position,
            kind: OperationKind::Delete,
            target,
            payload: Payload::Empty,
            if_match: None,
        }
    }

    /// Replaces the primary stream of a media entity.
    pub fn update_media(position: u32, target: Target, content: StreamPayload) -> Self {
        Self {
            position,
            kind: OperationKind::UpdateMedia,
            target,
            payload: Payload::Binary(content),
            if_match: None,
        }
    }

    /// Replaces a named stream property.
    pub fn update_stream(
        position: u32,
        target: Target,
        property: impl Into<String>,
        content: StreamPayload,
    ) -> Self {
        Self {
            position,
            kind: OperationKind::UpdateStream(property.into()),
            target,
            payload: Payload::Binary(content),
            if_match: None,
        }
    }

    /// Removes `linked` from the `navigation` collection of an entity.
    pub fn unlink(
        position: u32,
        target: Target,
        navigation: impl Into<String>,
        linked: impl Into<String>,
    ) -> Self {
        Self {
            position,
            kind: OperationKind::Unlink {
                navigation: navigation.into(),
                target: linked.into(),
            },
            target,
            payload: Payload::Empty,
            if_match: None,
        }
    }

    /// Sets the concurrency precondition.
    #[must_use]
    pub fn with_if_match(mut self, etag: Option<String>) -> Self {
        self.if_match = etag;
        self
    }

    /// Request address, including the media or stream suffix.
    pub fn url(&self) -> String {
        let base = self.target.render();
        match &self.kind {
            OperationKind::UpdateMedia => format!("{base}/$value"),
            OperationKind::UpdateStream(property) => format!("{base}/{property}"),
            OperationKind::Unlink { navigation, target } => {
                format!("{base}/{navigation}/$ref?$id={target}")
            }
            _ => base,
        }
    }

    /// The structured body, if any.
    pub fn record(&self) -> Option<&WireRecord> {
        match &self.payload {
            Payload::Record(record) => Some(record),
            _ => None,
        }
    }

    /// All batch positions this operation depends on.
    pub fn referenced_positions(&self) -> Vec<u32> {
        let mut positions = Vec::new();
        if let Target::Position(p) = self.target {
            positions.push(p);
        }
        if let Some(record) = self.record() {
            positions.extend(record.referenced_positions());
        }
        positions
    }

    /// Rewrites every positional reference to a durable address.
    ///
    /// Used when operations are submitted one at a time, where a `$n`
    /// reference has no meaning to the service.
    pub fn resolve_positions<F>(&self, resolve: F) -> ProtocolResult<Operation>
    where
        F: Fn(u32) -> Option<String>,
    {
        let mut resolved = self.clone();
        if let Target::Position(p) = resolved.target {
            let address = resolve(p).ok_or(ProtocolError::UnresolvedReference { position: p })?;
            resolved.target = Target::Address(address);
        }
        if let Payload::Record(record) = &mut resolved.payload {
            for binding in record.bindings.values_mut() {
                for target in &mut binding.targets {
                    if let LinkTarget::Position(p) = *target {
                        let address =
                            resolve(p).ok_or(ProtocolError::UnresolvedReference { position: p })?;
                        *target = LinkTarget::Address(address);
                    }
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_with_links() -> WireRecord {
        let mut record = WireRecord::new("Docs.File");
        record.properties.insert("Name".into(), json!("notes.txt"));
        record.bind("Parent", Cardinality::Single, Some(LinkTarget::Position(1)));
        record.bind(
            "Tags",
            Cardinality::Collection,
            Some(LinkTarget::Address("Tags(4)".into())),
        );
        record
    }

    #[test]
    fn methods_and_urls() {
        let create = Operation::create(2, "Files", record_with_links());
        assert_eq!(create.kind.method(), "POST");
        assert_eq!(create.url(), "Files");

        let media = Operation::update_media(
            3,
            Target::Position(2),
            StreamPayload::new("text/plain", b"hi".to_vec()),
        );
        assert_eq!(media.kind.method(), "PUT");
        assert_eq!(media.url(), "$2/$value");

        let stream = Operation::update_stream(
            4,
            Target::Address("Files(9)".into()),
            "Thumbnail",
            StreamPayload::new("image/png", vec![1u8]),
        );
        assert_eq!(stream.url(), "Files(9)/Thumbnail");

        let unlink = Operation::unlink(5, Target::Address("Folders(1)".into()), "Files", "Files(3)");
        assert_eq!(unlink.kind.method(), "DELETE");
        assert_eq!(unlink.url(), "Folders(1)/Files/$ref?$id=Files(3)");
        assert!(unlink.referenced_positions().is_empty());
    }

    #[test]
    fn referenced_positions_cover_target_and_bindings() {
        let op = Operation::update(5, Target::Position(3), record_with_links());
        assert_eq!(op.referenced_positions(), vec![3, 1]);
    }

    #[test]
    fn resolve_positions_rewrites_references() {
        let op = Operation::update(5, Target::Position(3), record_with_links());
        let resolved = op
            .resolve_positions(|p| Some(format!("Things({p})")))
            .unwrap();
        assert_eq!(resolved.target, Target::Address("Things(3)".into()));
        let parent = &resolved.record().unwrap().bindings["Parent"];
        assert_eq!(parent.targets, vec![LinkTarget::Address("Things(1)".into())]);
        assert!(resolved.referenced_positions().is_empty());
    }

    #[test]
    fn resolve_positions_reports_missing() {
        let op = Operation::create(2, "Files", record_with_links());
        let err = op.resolve_positions(|_| None).unwrap_err();
        assert_eq!(err, ProtocolError::UnresolvedReference { position: 1 });
    }

    #[test]
    fn bind_without_target_records_unset() {
        let mut record = WireRecord::new("Docs.File");
        record.bind("Parent", Cardinality::Single, None);
        assert!(!record.is_empty());
        assert!(record.bindings["Parent"].targets.is_empty());
    }
}
