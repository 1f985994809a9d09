//! Transport capability consumed by the core.

use entilink_protocol::{
    BatchRequest, BatchResponse, Operation, OperationKind, OperationResponse, ProtocolError,
    StreamPayload, WireEntity,
};
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

/// Result type for transport calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors reported by a transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The request could not be delivered.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the request may be retried.
        retryable: bool,
    },

    /// The service answered with a failure status.
    #[error("request rejected with status {status}: {message}")]
    Rejected {
        /// HTTP-style status code.
        status: u16,
        /// Error message returned by the service.
        message: String,
    },

    /// The service answered with a malformed payload.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The transport has been closed.
    #[error("not connected to service")]
    NotConnected,
}

impl TransportError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a rejection error.
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Returns true if the failure is worth retrying.
    ///
    /// The core never retries; this is for callers that do.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network { retryable, .. } => *retryable,
            TransportError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Network access to an entity-graph service.
///
/// All URIs are relative to the service root. Implementations must be safe
/// to share between threads; the core calls them from whichever thread
/// flushes or navigates.
pub trait Transport: Send + Sync {
    /// Submits one operation.
    fn submit(&self, operation: &Operation) -> TransportResult<OperationResponse>;

    /// Submits an atomic changeset.
    ///
    /// Per-item failures are reported in the response, not as an error.
    fn submit_batch(&self, batch: &BatchRequest) -> TransportResult<BatchResponse>;

    /// Fetches one entity. A missing entity is `Ok(None)`.
    fn fetch_entity(&self, uri: &str) -> TransportResult<Option<WireEntity>>;

    /// Fetches a collection of entities.
    fn fetch_collection(&self, uri: &str) -> TransportResult<Vec<WireEntity>>;

    /// Fetches binary content.
    fn fetch_stream(&self, uri: &str) -> TransportResult<StreamPayload>;

    /// Invokes an operation bound to the resource at `uri`.
    fn invoke(&self, uri: &str, operation: &str, parameters: &Json) -> TransportResult<Json>;
}

/// A scriptable transport for unit tests.
///
/// Queued replies are consumed first. With an empty queue, creates are
/// answered with a fresh integer `Id` and every other operation with
/// `204 No Content`.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    next_key: AtomicU64,
    replies: Mutex<VecDeque<TransportResult<OperationResponse>>>,
    batch_replies: Mutex<VecDeque<TransportResult<BatchResponse>>>,
    entities: Mutex<HashMap<String, WireEntity>>,
    collections: Mutex<HashMap<String, Vec<WireEntity>>>,
    streams: Mutex<HashMap<String, StreamPayload>>,
    submitted: Mutex<Vec<Operation>>,
    batches: Mutex<Vec<BatchRequest>>,
    fetches: Mutex<Vec<String>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            next_key: AtomicU64::new(1),
            replies: Mutex::new(VecDeque::new()),
            batch_replies: Mutex::new(VecDeque::new()),
            entities: Mutex::new(HashMap::new()),
            collections: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
        }
    }

    /// Queues the reply to the next single submission.
    pub fn push_reply(&self, reply: TransportResult<OperationResponse>) {
        self.replies.lock().push_back(reply);
    }

    /// Queues the reply to the next batch submission.
    pub fn push_batch_reply(&self, reply: TransportResult<BatchResponse>) {
        self.batch_replies.lock().push_back(reply);
    }

    /// Serves an entity at `uri`.
    pub fn set_entity(&self, uri: impl Into<String>, entity: WireEntity) {
        self.entities.lock().insert(uri.into(), entity);
    }

    /// Serves a collection at `uri`.
    pub fn set_collection(&self, uri: impl Into<String>, entities: Vec<WireEntity>) {
        self.collections.lock().insert(uri.into(), entities);
    }

    /// Serves binary content at `uri`.
    pub fn set_stream(&self, uri: impl Into<String>, payload: StreamPayload) {
        self.streams.lock().insert(uri.into(), payload);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Operations submitted one at a time.
    pub fn submitted(&self) -> Vec<Operation> {
        self.submitted.lock().clone()
    }

    /// Batches submitted.
    pub fn batches(&self) -> Vec<BatchRequest> {
        self.batches.lock().clone()
    }

    /// URIs fetched, in order.
    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().clone()
    }

    /// Number of network submissions (single operations plus batches).
    pub fn submission_count(&self) -> usize {
        self.submitted.lock().len() + self.batches.lock().len()
    }

    fn check_connected(&self) -> TransportResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn auto_reply(&self, operation: &Operation) -> OperationResponse {
        match (&operation.kind, operation.record()) {
            (OperationKind::Create, Some(record)) => {
                let key = self.next_key.fetch_add(1, Ordering::SeqCst);
                let mut entity = WireEntity::new(record.type_name.clone())
                    .with_id(format!("{}({key})", operation.target.render()))
                    .with_etag("W/\"1\"")
                    .with_property("Id", Json::from(key));
                entity.merge_properties(&record.properties);
                OperationResponse::created(operation.position, entity)
            }
            _ => OperationResponse::no_content(operation.position),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn submit(&self, operation: &Operation) -> TransportResult<OperationResponse> {
        self.check_connected()?;
        self.submitted.lock().push(operation.clone());
        let queued = self.replies.lock().pop_front();
        queued.unwrap_or_else(|| Ok(self.auto_reply(operation)))
    }

    fn submit_batch(&self, batch: &BatchRequest) -> TransportResult<BatchResponse> {
        self.check_connected()?;
        self.batches.lock().push(batch.clone());
        let queued = self.batch_replies.lock().pop_front();
        queued.unwrap_or_else(|| {
            Ok(BatchResponse::accepted(
                batch.operations.iter().map(|op| self.auto_reply(op)).collect(),
            ))
        })
    }

    fn fetch_entity(&self, uri: &str) -> TransportResult<Option<WireEntity>> {
        self.check_connected()?;
        self.fetches.lock().push(uri.to_string());
        Ok(self.entities.lock().get(uri).cloned())
    }

    fn fetch_collection(&self, uri: &str) -> TransportResult<Vec<WireEntity>> {
        self.check_connected()?;
        self.fetches.lock().push(uri.to_string());
        Ok(self.collections.lock().get(uri).cloned().unwrap_or_default())
    }

    fn fetch_stream(&self, uri: &str) -> TransportResult<StreamPayload> {
        self.check_connected()?;
        self.fetches.lock().push(uri.to_string());
        self.streams
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| TransportError::rejected(404, format!("no stream at {uri}")))
    }

    fn invoke(&self, uri: &str, operation: &str, parameters: &Json) -> TransportResult<Json> {
        self.check_connected()?;
        self.fetches.lock().push(format!("{uri}/{operation}"));
        Ok(serde_json::json!({
            "uri": uri,
            "operation": operation,
            "parameters": parameters,
        }))
    }
}
