//! Error types for EntiLink core.

use crate::transport::TransportError;
use crate::types::HandleId;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the change-tracking core.
///
/// `NotAttached`, `NotYetDurable`, `NotFlushed`, `IllegalArgument`,
/// `Removed` and `NotFound` are raised before any network activity.
/// `Transport` and `TransactionAborted` abort a flush in progress.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The registry was queried about a handle it does not track.
    #[error("entity {handle} is not attached to the session")]
    NotAttached {
        /// The untracked handle.
        handle: HandleId,
    },

    /// Navigation data was requested on an entity that has not been created yet.
    #[error("entity {handle} is not durable: flush pending creation before navigating")]
    NotYetDurable {
        /// The new handle.
        handle: HandleId,
    },

    /// A bound operation was invoked on a collection without a backing address.
    #[error("this collection has not yet been committed")]
    NotFlushed,

    /// A pending edit is malformed.
    #[error("illegal argument: {message}")]
    IllegalArgument {
        /// Description of the problem.
        message: String,
    },

    /// The entity was deleted and the deletion committed.
    #[error("entity {handle} has been removed")]
    Removed {
        /// The removed handle.
        handle: HandleId,
    },

    /// An entity set, singleton, type or entity does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// Transport failure, surfaced unchanged.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A batched commit was rejected as a whole.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason reported by the service.
        reason: String,
    },

    /// A wire value could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] entilink_codec::CodecError),

    /// A wire structure was malformed.
    #[error("protocol error: {0}")]
    Protocol(#[from] entilink_protocol::ProtocolError),
}

impl CoreError {
    /// Creates an illegal argument error.
    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Self::IllegalArgument {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Returns true if the error was raised before any network activity.
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            CoreError::NotAttached { .. }
                | CoreError::NotYetDurable { .. }
                | CoreError::NotFlushed
                | CoreError::IllegalArgument { .. }
                | CoreError::Removed { .. }
                | CoreError::NotFound { .. }
        )
    }
}
