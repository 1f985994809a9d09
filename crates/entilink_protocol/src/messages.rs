//! Responses and batch envelopes.

use crate::entity::WireEntity;
use crate::operation::Operation;

/// Outcome of one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResponse {
    /// Position of the operation this answers.
    pub position: u32,
    /// HTTP-style status code.
    pub status: u16,
    /// Returned entity representation, when the service sent one.
    pub entity: Option<WireEntity>,
    /// Address of a created entity.
    pub location: Option<String>,
    /// New concurrency token.
    pub etag: Option<String>,
    /// Error message for failed operations.
    pub error: Option<String>,
}

impl OperationResponse {
    /// A successful create carrying the new representation.
    pub fn created(position: u32, entity: WireEntity) -> Self {
        Self {
            position,
            status: 201,
            location: entity.id.clone(),
            etag: entity.etag.clone(),
            entity: Some(entity),
            error: None,
        }
    }

    /// A successful operation with a representation.
    pub fn ok(position: u32, entity: WireEntity) -> Self {
        Self {
            position,
            status: 200,
            location: None,
            etag: entity.etag.clone(),
            entity: Some(entity),
            error: None,
        }
    }

    /// A successful operation without a body.
    pub fn no_content(position: u32) -> Self {
        Self {
            position,
            status: 204,
            entity: None,
            location: None,
            etag: None,
            error: None,
        }
    }

    /// A failed operation.
    pub fn error(position: u32, status: u16, message: impl Into<String>) -> Self {
        Self {
            position,
            status,
            entity: None,
            location: None,
            etag: None,
            error: Some(message.into()),
        }
    }

    /// Sets the concurrency token.
    #[must_use]
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Address of the entity the response describes, if known.
    pub fn address(&self) -> Option<&str> {
        self.location
            .as_deref()
            .or_else(|| self.entity.as_ref().and_then(|e| e.id.as_deref()))
    }
}

/// One atomic changeset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRequest {
    /// Operations in submission order.
    pub operations: Vec<Operation>,
}

impl BatchRequest {
    /// Creates a batch from planned operations.
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if the batch has no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Outcome of an atomic changeset.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResponse {
    /// Envelope status.
    pub status: u16,
    /// Per-operation responses.
    pub items: Vec<OperationResponse>,
    /// Envelope error message.
    pub error: Option<String>,
}

impl BatchResponse {
    /// An accepted changeset.
    pub fn accepted(items: Vec<OperationResponse>) -> Self {
        Self {
            status: 200,
            items,
            error: None,
        }
    }

    /// A rejected changeset.
    pub fn rejected(status: u16, message: impl Into<String>, items: Vec<OperationResponse>) -> Self {
        Self {
            status,
            items,
            error: Some(message.into()),
        }
    }

    /// Returns true if the envelope reports acceptance.
    pub fn is_accepted(&self) -> bool {
        (200..300).contains(&self.status) && self.error.is_none()
    }

    /// Response for the operation at `position`.
    pub fn item(&self, position: u32) -> Option<&OperationResponse> {
        self.items.iter().find(|item| item.position == position)
    }

    /// The first item reporting failure.
    pub fn first_failure(&self) -> Option<&OperationResponse> {
        self.items.iter().find(|item| !item.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_carries_location_and_etag() {
        let entity = WireEntity::new("Docs.Folder")
            .with_id("Folders(1)")
            .with_etag("W/\"1\"");
        let response = OperationResponse::created(1, entity);
        assert!(response.is_success());
        assert_eq!(response.address(), Some("Folders(1)"));
        assert_eq!(response.etag.as_deref(), Some("W/\"1\""));
    }

    #[test]
    fn envelope_acceptance() {
        let ok = BatchResponse::accepted(vec![OperationResponse::no_content(1)]);
        assert!(ok.is_accepted());
        assert!(ok.first_failure().is_none());

        let failed = BatchResponse::rejected(
            400,
            "changeset failed",
            vec![OperationResponse::error(2, 400, "bad")],
        );
        assert!(!failed.is_accepted());
        assert_eq!(failed.first_failure().map(|r| r.position), Some(2));
        assert!(failed.item(1).is_none());
    }
}
