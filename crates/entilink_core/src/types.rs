//! Core type definitions for EntiLink.

use std::fmt;

/// Session-unique identifier of an entity handle.
///
/// Handle IDs are assigned in creation order and never reused within a
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub u64);

impl HandleId {
    /// Creates a new handle ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity:{}", self.0)
    }
}

/// Lifecycle status of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityStatus {
    /// Created locally, no server key yet.
    New,
    /// Durable, no pending edits.
    Attached,
    /// Durable, tracked because another entity links to it.
    Linked,
    /// Durable, has pending edits.
    Changed,
    /// Marked for removal.
    Deleted,
}

impl EntityStatus {
    /// Returns the status name.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityStatus::New => "NEW",
            EntityStatus::Attached => "ATTACHED",
            EntityStatus::Linked => "LINKED",
            EntityStatus::Changed => "CHANGED",
            EntityStatus::Deleted => "DELETED",
        }
    }

    /// Status after a setter call.
    ///
    /// Only durable, unedited entities move; NEW and DELETED stay put.
    #[must_use]
    pub fn after_edit(self) -> Self {
        match self {
            EntityStatus::Attached | EntityStatus::Linked => EntityStatus::Changed,
            other => other,
        }
    }

    /// Returns true if the status alone makes an entity dirty.
    pub fn is_dirty(self) -> bool {
        matches!(self, EntityStatus::New | EntityStatus::Deleted)
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_id_display() {
        assert_eq!(HandleId::new(7).to_string(), "entity:7");
        assert!(HandleId::new(1) < HandleId::new(2));
    }

    #[test]
    fn edits_move_only_durable_clean_statuses() {
        assert_eq!(EntityStatus::Attached.after_edit(), EntityStatus::Changed);
        assert_eq!(EntityStatus::Linked.after_edit(), EntityStatus::Changed);
        assert_eq!(EntityStatus::New.after_edit(), EntityStatus::New);
        assert_eq!(EntityStatus::Deleted.after_edit(), EntityStatus::Deleted);
        assert_eq!(EntityStatus::Changed.after_edit(), EntityStatus::Changed);
    }

    #[test]
    fn status_dirtiness() {
        assert!(EntityStatus::New.is_dirty());
        assert!(EntityStatus::Deleted.is_dirty());
        assert!(!EntityStatus::Changed.is_dirty());
        assert_eq!(EntityStatus::Linked.to_string(), "LINKED");
    }
}
