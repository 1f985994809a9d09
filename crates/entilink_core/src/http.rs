//! HTTP transport implementation.
//!
//! The HTTP client itself is abstracted by [`HttpClient`], so any blocking
//! client (ureq, reqwest's blocking API, a signing proxy) can be plugged
//! in. Authentication belongs to the client implementation.

use crate::transport::{Transport, TransportError, TransportResult};
use bytes::Bytes;
use entilink_protocol::{
    entities_from_json, BatchRequest, BatchResponse, Operation, OperationKind, OperationResponse,
    Payload, StreamPayload, WireEntity, WireLink,
};
use parking_lot::RwLock;
use serde_json::Value as Json;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// One HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Request method.
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Bytes>,
}

impl HttpRequest {
    fn new(method: &str, url: String) -> Self {
        Self {
            method: method.to_string(),
            url,
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            body: None,
        }
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    fn json(self, body: &Json) -> Self {
        let mut request = self.header("Content-Type", "application/json");
        request.body = Some(Bytes::from(body.to_string()));
        request
    }

    /// Value of a request header, compared case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// One HTTP response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Creates a response with a JSON body.
    pub fn json(status: u16, body: &Json) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    /// Value of a response header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn body_json(&self) -> TransportResult<Option<Json>> {
        if self.body.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&self.body)
            .map(Some)
            .map_err(|e| TransportError::Protocol(e.into()))
    }

    fn error_message(&self) -> String {
        self.body_json()
            .ok()
            .flatten()
            .and_then(|body| {
                body.pointer("/error/message")
                    .and_then(Json::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("status {}", self.status))
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// HTTP client abstraction.
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response, or a transport-level
    /// error message if no response was received.
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// OData JSON transport over an [`HttpClient`].
pub struct HttpTransport<C: HttpClient> {
    service_root: String,
    client: C,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport for the service at `service_root`.
    pub fn new(service_root: impl Into<String>, client: C) -> Self {
        Self {
            service_root: service_root.into().trim_end_matches('/').to_string(),
            client,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the service root.
    pub fn service_root(&self) -> &str {
        &self.service_root
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns true if requests can be sent.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    /// Stops sending requests.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn url(&self, uri: &str) -> String {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            uri.to_string()
        } else {
            format!("{}/{}", self.service_root, uri.trim_start_matches('/'))
        }
    }

    fn relativize(&self, address: &str) -> String {
        address
            .strip_prefix(&self.service_root)
            .map(|rest| rest.trim_start_matches('/').to_string())
            .unwrap_or_else(|| address.to_string())
    }

    fn relativize_entity(&self, entity: &mut WireEntity) {
        if let Some(id) = &entity.id {
            entity.id = Some(self.relativize(id));
        }
        if let Some(media) = &mut entity.media {
            if let Some(link) = &media.read_link {
                media.read_link = Some(self.relativize(link));
            }
        }
        for link in entity.stream_links.values_mut() {
            *link = self.relativize(link);
        }
        for link in entity.links.values_mut() {
            match link {
                WireLink::Deferred(uri) => *uri = self.relativize(uri),
                WireLink::Entity(target) => self.relativize_entity(target),
                WireLink::Entities(targets) => {
                    for target in targets {
                        self.relativize_entity(target);
                    }
                }
                WireLink::Null => {}
            }
        }
    }

    fn relativize_response(&self, response: &mut OperationResponse) {
        if let Some(location) = &response.location {
            response.location = Some(self.relativize(location));
        }
        if let Some(entity) = &mut response.entity {
            self.relativize_entity(entity);
        }
    }

    fn send(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        debug!(method = %request.method, url = %request.url, "sending request");
        match self.client.send(request) {
            Ok(response) => {
                *self.last_error.write() = None;
                Ok(response)
            }
            Err(message) => {
                *self.last_error.write() = Some(message.clone());
                self.connected.store(false, Ordering::SeqCst);
                Err(TransportError::network_retryable(message))
            }
        }
    }

    fn get(&self, uri: &str) -> TransportResult<HttpResponse> {
        self.send(HttpRequest::new("GET", self.url(uri)))
    }

    fn operation_request(&self, operation: &Operation) -> HttpRequest {
        let mut request = HttpRequest::new(operation.kind.method(), self.url(&operation.url()));
        if let Some(etag) = &operation.if_match {
            request = request.header("If-Match", etag.clone());
        }
        if matches!(operation.kind, OperationKind::Create | OperationKind::Update) {
            request = request.header("Prefer", "return=representation");
        }
        match &operation.payload {
            Payload::Empty => request,
            Payload::Record(record) => request.json(&record.to_json()),
            Payload::Binary(content) => {
                let content_type = content
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let mut request = request.header("Content-Type", content_type);
                request.body = Some(content.bytes.clone());
                request
            }
        }
    }
}

impl<C: HttpClient> Transport for HttpTransport<C> {
    fn submit(&self, operation: &Operation) -> TransportResult<OperationResponse> {
        let response = self.send(self.operation_request(operation))?;
        let body = response.body_json()?;
        let mut parsed = OperationResponse::from_parts(
            operation.position,
            response.status,
            response
                .header("Location")
                .or_else(|| response.header("OData-EntityId"))
                .map(str::to_string),
            response.header("ETag").map(str::to_string),
            body.as_ref(),
        )?;
        self.relativize_response(&mut parsed);
        Ok(parsed)
    }

    fn submit_batch(&self, batch: &BatchRequest) -> TransportResult<BatchResponse> {
        let request = HttpRequest::new("POST", self.url("$batch")).json(&batch.to_json());
        let response = self.send(request)?;
        let mut parsed = match response.body_json()? {
            Some(body) if body.get("responses").is_some() => {
                BatchResponse::from_json(response.status, &body)?
            }
            _ => BatchResponse::rejected(response.status, response.error_message(), Vec::new()),
        };
        for item in &mut parsed.items {
            self.relativize_response(item);
        }
        Ok(parsed)
    }

    fn fetch_entity(&self, uri: &str) -> TransportResult<Option<WireEntity>> {
        let response = self.get(uri)?;
        if response.status == 404 {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(TransportError::rejected(response.status, response.error_message()));
        }
        match response.body_json()? {
            Some(body) => {
                let mut entity = WireEntity::from_json(&body)?;
                if entity.etag.is_none() {
                    entity.etag = response.header("ETag").map(str::to_string);
                }
                self.relativize_entity(&mut entity);
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    fn fetch_collection(&self, uri: &str) -> TransportResult<Vec<WireEntity>> {
        let response = self.get(uri)?;
        if !response.is_success() {
            return Err(TransportError::rejected(response.status, response.error_message()));
        }
        let Some(body) = response.body_json()? else {
            return Ok(Vec::new());
        };
        let mut entities = entities_from_json(&body)?;
        for entity in &mut entities {
            self.relativize_entity(entity);
        }
        Ok(entities)
    }

    fn fetch_stream(&self, uri: &str) -> TransportResult<StreamPayload> {
        let response = self.get(uri)?;
        if !response.is_success() {
            return Err(TransportError::rejected(response.status, response.error_message()));
        }
        Ok(StreamPayload {
            content_type: response.header("Content-Type").map(str::to_string),
            bytes: response.body,
        })
    }

    fn invoke(&self, uri: &str, operation: &str, parameters: &Json) -> TransportResult<Json> {
        let url = self.url(&format!("{uri}/{operation}"));
        let response = self.send(HttpRequest::new("POST", url).json(parameters))?;
        if !response.is_success() {
            return Err(TransportError::rejected(response.status, response.error_message()));
        }
        Ok(response.body_json()?.unwrap_or(Json::Null))
    }
}
