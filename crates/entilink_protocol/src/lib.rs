//! # EntiLink Protocol
//!
//! Wire model shared by the change-tracking core and its transports.
//!
//! This crate defines:
//! - [`WireEntity`]: an entity as last returned by the service
//! - [`Operation`]: one planned create, update, delete or stream upload
//! - [`BatchRequest`] / [`BatchResponse`]: the atomic changeset envelope
//! - OData JSON encodings of all of the above, used by HTTP transports
//!
//! Addresses carried here are always relative to the service root.
//! Positional references (`$n`) name an earlier operation of the same
//! atomic batch and must be resolved before an operation is sent alone.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod error;
mod json;
mod messages;
mod operation;

pub use entity::{MediaInfo, WireEntity, WireLink};
pub use error::{ProtocolError, ProtocolResult};
pub use json::entities_from_json;
pub use messages::{BatchRequest, BatchResponse, OperationResponse};
pub use operation::{
    Binding, Cardinality, LinkTarget, Operation, OperationKind, Payload, StreamPayload, Target,
    WireRecord,
};
