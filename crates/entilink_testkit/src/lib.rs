//! # EntiLink Testkit
//!
//! Test utilities for EntiLink.
//!
//! This crate provides:
//! - [`InMemoryService`], a fake entity-graph service implementing `Transport`
//! - Metadata fixtures and session helpers
//! - Property-based test generators using proptest
//! - One-time `tracing` initialization for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use entilink_testkit::prelude::*;
//!
//! #[test]
//! fn creates_a_folder() {
//!     let (session, service) = service_session(CommitMode::Batched);
//!     let folder = session.container().create("Folders").unwrap();
//!     folder.set("Name", "Projects").unwrap();
//!     session.flush().unwrap();
//!     assert!(service.contains("Folders(1)"));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod service;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::service::*;
    pub use entilink_core::CommitMode;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use service::*;
