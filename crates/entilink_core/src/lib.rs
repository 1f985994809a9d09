//! # EntiLink Core
//!
//! Client-side change tracking for entity-graph services.
//!
//! This crate provides:
//! - A [`Session`] holding the entity registry and identity map
//! - Entity handles with three-tier property reads and lazy navigation
//! - Collection handles with local link/unlink bookkeeping
//! - A dependency-ordered commit planner with positional back-references
//! - Batched (atomic) and sequential commit execution
//! - A transport abstraction with a mock and an HTTP implementation
//!
//! ## Architecture
//!
//! Handles never talk to the network while edits are made. Every setter,
//! link change or deletion only updates the handle and its registry
//! status. [`Session::flush`] turns the registry into an ordered list of
//! operations, submits them and reflects the responses on the handles.
//!
//! ## Key Invariants
//!
//! - Targets are created before the entities that link to them
//! - A batched flush either commits everything or changes nothing locally
//! - A keyed identity is tracked at most once per session
//! - Committed deletions make a handle unusable

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod commit;
mod config;
mod container;
mod entity;
mod error;
mod http;
mod identity;
mod metadata;
mod registry;
mod session;
mod transport;
mod types;

pub use collection::CollectionHandle;
pub use commit::{FlushReport, SessionStats};
pub use config::{CommitMode, SessionConfig};
pub use container::{EntitySetQuery, RootContainer};
pub use entity::EntityHandle;
pub use error::{CoreError, CoreResult};
pub use http::{HttpClient, HttpRequest, HttpResponse, HttpTransport};
pub use identity::{key_from_address, key_literal, EntityIdentity};
pub use metadata::{EntityTypeDescriptor, NavigationProperty, ServiceMetadata};
pub use session::Session;
pub use transport::{MockTransport, Transport, TransportError, TransportResult};
pub use types::{EntityStatus, HandleId};
