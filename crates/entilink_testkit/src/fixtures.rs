//! Test fixtures and session helpers.
//!
//! Provides the sample document-store metadata used across the test suites
//! and convenience constructors for sessions over the in-memory service or
//! the scriptable mock transport.

use crate::service::InMemoryService;
use entilink_codec::{ComplexType, PrimitiveKind, TypeDescriptor};
use entilink_core::{
    CommitMode, EntityTypeDescriptor, MockTransport, ServiceMetadata, Session, SessionConfig,
};
use entilink_protocol::{Cardinality, WireEntity};
use serde_json::json;
use std::sync::Arc;

/// Service root used by every fixture session.
pub const SERVICE_ROOT: &str = "https://docs.example.com/odata";

/// Metadata of a small document store.
///
/// - `Folders` (`Docs.Folder`): `Id`, `Name`, complex `Location`;
///   navigations `Files` (collection), `Parent` and `Cover`; bound
///   operation `Archive`
/// - `Files` (`Docs.File`): `Id`, `Name`, `Size`; navigations `Parent`
///   and `Related`; bound operation `Compress`
/// - `Photos` (`Docs.Photo`): media entity with a `Thumbnail` stream
/// - `Settings`: singleton of `Docs.Settings`
///
/// Unit tests inside `entilink_core` keep a private copy of this schema,
/// since that crate cannot depend on the testkit.
pub fn docs_metadata() -> ServiceMetadata {
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

/// Session configuration for the given commit mode.
pub fn docs_config(mode: CommitMode) -> SessionConfig {
    SessionConfig::new(SERVICE_ROOT).with_commit_mode(mode)
}

/// A session over a fresh [`InMemoryService`].
pub fn service_session(mode: CommitMode) -> (Session, Arc<InMemoryService>) {
    let service = Arc::new(InMemoryService::new(docs_metadata()));
    let session = Session::new(docs_config(mode), docs_metadata(), service.clone());
    (session, service)
}

/// A second session over an existing service, as another client would see it.
pub fn reopen(service: &Arc<InMemoryService>, mode: CommitMode) -> Session {
    Session::new(docs_config(mode), docs_metadata(), service.clone())
}

/// A session over a fresh [`MockTransport`].
pub fn mock_session(mode: CommitMode) -> (Session, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let session = Session::new(docs_config(mode), docs_metadata(), transport.clone());
    (session, transport)
}

/// Wire form of a stored folder.
pub fn folder_wire(id: i64, name: &str) -> WireEntity {
    WireEntity::new("Docs.Folder")
        .with_id(format!("Folders({id})"))
        .with_etag("W/\"1\"")
        .with_property("Id", json!(id))
        .with_property("Name", json!(name))
}

/// Wire form of a stored file.
pub fn file_wire(id: i64, name: &str, size: i64) -> WireEntity {
    WireEntity::new("Docs.File")
        .with_id(format!("Files({id})"))
        .with_etag("W/\"1\"")
        .with_property("Id", json!(id))
        .with_property("Name", json!(name))
        .with_property("Size", json!(size))
}
