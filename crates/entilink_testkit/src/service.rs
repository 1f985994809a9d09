//! In-memory entity-graph service.
//!
//! [`InMemoryService`] implements [`Transport`] against a small record
//! store, so flush scenarios can be checked end to end: keys are assigned
//! on create, batches are atomic, `$n` back-references resolve to the
//! addresses created earlier in the same batch and `If-Match` tokens are
//! enforced.

use entilink_core::{ServiceMetadata, Transport, TransportError, TransportResult};
use entilink_protocol::{
    BatchRequest, BatchResponse, Cardinality, LinkTarget, MediaInfo, Operation, OperationKind,
    OperationResponse, Payload, StreamPayload, Target, WireEntity, WireRecord,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value as Json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

const MEDIA_SEGMENT: &str = "$value";

#[derive(Debug, Clone)]
struct StoredRecord {
    set: String,
    type_name: String,
    sequence: u64,
    properties: Map<String, Json>,
    links: BTreeMap<String, Vec<String>>,
    version: u64,
    media: Option<StreamPayload>,
    media_version: u64,
    streams: BTreeMap<String, StreamPayload>,
}

impl StoredRecord {
    fn etag(&self) -> String {
        format!("W/\"{}\"", self.version)
    }

    fn media_etag(&self) -> String {
        format!("W/\"m{}\"", self.media_version)
    }
}

#[derive(Debug, Clone, Default)]
struct ServiceState {
    records: BTreeMap<String, StoredRecord>,
    next_keys: HashMap<String, i64>,
    next_sequence: u64,
}

#[derive(Debug)]
struct Failure {
    status: u16,
    message: String,
}

impl Failure {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(address: &str) -> Self {
        Self::new(404, format!("no entity at {address}"))
    }

    fn into_response(self, position: u32) -> OperationResponse {
        OperationResponse::error(position, self.status, self.message)
    }
}

#[derive(Debug)]
struct Injection {
    remaining: usize,
    status: u16,
    message: String,
}

/// A fake service holding records in memory.
#[derive(Debug)]
pub struct InMemoryService {
    metadata: ServiceMetadata,
    state: Mutex<ServiceState>,
    injection: Mutex<Option<Injection>>,
    connected: AtomicBool,
    submissions: AtomicUsize,
    operations: AtomicUsize,
    fetches: AtomicUsize,
    invocations: Mutex<Vec<(String, String)>>,
}

impl InMemoryService {
    /// Creates an empty service for the given metadata.
    pub fn new(metadata: ServiceMetadata) -> Self {
        Self {
            metadata,
            state: Mutex::new(ServiceState::default()),
            injection: Mutex::new(None),
            connected: AtomicBool::new(true),
            submissions: AtomicUsize::new(0),
            operations: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            invocations: Mutex::new(Vec::new()),
        }
    }

    // ========================================================================
    // Seeding
    // ========================================================================

    /// Stores a record in an entity set and returns its address.
    ///
    /// The key is taken from `properties` when present, otherwise assigned.
    ///
    /// # Panics
    ///
    /// Panics if the entity set is not declared.
    pub fn insert(&self, entity_set: &str, properties: Json) -> String {
        let ty = self
            .metadata
            .entity_set_type(entity_set)
            .expect("entity set must be declared");
        let mut state = self.state.lock();
        let mut stored = new_record(&mut state, entity_set, &ty.name);
        stored.properties = properties.as_object().cloned().unwrap_or_default();
        let key = allocate_key(&mut state, entity_set, ty.keys.first(), &mut stored.properties);
        let address = format!("{entity_set}({key})");
        state.records.insert(address.clone(), stored);
        address
    }

    /// Stores the record behind a singleton.
    ///
    /// # Panics
    ///
    /// Panics if the singleton is not declared.
    pub fn insert_singleton(&self, name: &str, properties: Json) {
        let ty = self
            .metadata
            .singleton_type(name)
            .expect("singleton must be declared");
        let mut state = self.state.lock();
        let mut stored = new_record(&mut state, name, &ty.name);
        stored.properties = properties.as_object().cloned().unwrap_or_default();
        state.records.insert(name.to_string(), stored);
    }

    /// Adds a link between two stored records.
    pub fn link(&self, from: &str, navigation: &str, to: &str) {
        if let Some(stored) = self.state.lock().records.get_mut(from) {
            let targets = stored.links.entry(navigation.to_string()).or_default();
            if !targets.iter().any(|t| t == to) {
                targets.push(to.to_string());
            }
        }
    }

    /// Stores the binary content of a media record.
    pub fn put_media(&self, address: &str, payload: StreamPayload) {
        if let Some(stored) = self.state.lock().records.get_mut(address) {
            stored.media = Some(payload);
            stored.media_version += 1;
        }
    }

    /// Stores a named stream of a record.
    pub fn put_stream(&self, address: &str, name: &str, payload: StreamPayload) {
        if let Some(stored) = self.state.lock().records.get_mut(address) {
            stored.streams.insert(name.to_string(), payload);
        }
    }

    /// Makes the `nth` operation processed from now on fail.
    ///
    /// Counting includes operations inside batches, so a batch containing
    /// the failing operation is rolled back.
    pub fn reject_nth_operation(&self, nth: usize, status: u16, message: impl Into<String>) {
        *self.injection.lock() = Some(Injection {
            remaining: nth.max(1),
            status,
            message: message.into(),
        });
    }

    /// Connects or disconnects the service.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Returns true if a record is stored at `address`.
    pub fn contains(&self, address: &str) -> bool {
        self.state.lock().records.contains_key(address)
    }

    /// Number of records in an entity set.
    pub fn count(&self, entity_set: &str) -> usize {
        self.state
            .lock()
            .records
            .values()
            .filter(|stored| stored.set == entity_set)
            .count()
    }

    /// Stored value of one property.
    pub fn property(&self, address: &str, name: &str) -> Option<Json> {
        self.state
            .lock()
            .records
            .get(address)
            .and_then(|stored| stored.properties.get(name).cloned())
    }

    /// Addresses linked from `address` through `navigation`.
    pub fn links(&self, address: &str, navigation: &str) -> Vec<String> {
        self.state
            .lock()
            .records
            .get(address)
            .and_then(|stored| stored.links.get(navigation).cloned())
            .unwrap_or_default()
    }

    /// Current concurrency token of a record.
    pub fn etag(&self, address: &str) -> Option<String> {
        self.state.lock().records.get(address).map(StoredRecord::etag)
    }

    /// Binary content of a media record.
    pub fn media(&self, address: &str) -> Option<StreamPayload> {
        self.state
            .lock()
            .records
            .get(address)
            .and_then(|stored| stored.media.clone())
    }

    /// Content of a named stream.
    pub fn stream(&self, address: &str, name: &str) -> Option<StreamPayload> {
        self.state
            .lock()
            .records
            .get(address)
            .and_then(|stored| stored.streams.get(name).cloned())
    }

    /// Number of network submissions (single operations and batches).
    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Number of operations processed, including rolled back ones.
    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    /// Number of reads.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Bound operations invoked so far, as `(uri, operation)` pairs.
    pub fn invocations(&self) -> Vec<(String, String)> {
        self.invocations.lock().clone()
    }

    // ========================================================================
    // Operation processing
    // ========================================================================

    fn check_connected(&self) -> TransportResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn check_injection(&self) -> Result<(), Failure> {
        let mut injection = self.injection.lock();
        if let Some(pending) = injection.as_mut() {
            pending.remaining -= 1;
            if pending.remaining == 0 {
                let failure = Failure::new(pending.status, pending.message.clone());
                *injection = None;
                return Err(failure);
            }
        }
        Ok(())
    }

    fn process(
        &self,
        state: &mut ServiceState,
        operation: &Operation,
        created: &HashMap<u32, String>,
    ) -> Result<OperationResponse, Failure> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.check_injection()?;
        let target = match &operation.target {
            Target::Collection(set) | Target::Address(set) => set.clone(),
            Target::Position(position) => created
                .get(position)
                .cloned()
                .ok_or_else(|| Failure::new(400, format!("unknown back-reference ${position}")))?,
        };
        let position = operation.position;
        debug!(position, method = operation.kind.method(), %target, "processing operation");

        match (&operation.kind, &operation.payload) {
            (OperationKind::Create, Payload::Record(record)) => {
                self.create(state, position, &target, record, created)
            }
            (OperationKind::Update, Payload::Record(record)) => {
                let mut stored = lookup(state, &target)?.clone();
                check_if_match(operation.if_match.as_deref(), &stored.etag())?;
                stored
                    .properties
                    .extend(record.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
                bind(state, &mut stored, record, created)?;
                stored.version += 1;
                let etag = stored.etag();
                state.records.insert(target, stored);
                Ok(OperationResponse::no_content(position).with_etag(etag))
            }
            (OperationKind::Delete, _) => {
                let stored = lookup(state, &target)?;
                check_if_match(operation.if_match.as_deref(), &stored.etag())?;
                state.records.remove(&target);
                for other in state.records.values_mut() {
                    for targets in other.links.values_mut() {
                        targets.retain(|t| *t != target);
                    }
                }
                Ok(OperationResponse::no_content(position))
            }
            (OperationKind::UpdateMedia, Payload::Binary(content)) => {
                let stored = state
                    .records
                    .get_mut(&target)
                    .ok_or_else(|| Failure::not_found(&target))?;
                check_if_match(operation.if_match.as_deref(), &stored.media_etag())?;
                stored.media = Some(content.clone());
                stored.media_version += 1;
                Ok(OperationResponse::no_content(position).with_etag(stored.media_etag()))
            }
            (OperationKind::UpdateStream(name), Payload::Binary(content)) => {
                let stored = state
                    .records
                    .get_mut(&target)
                    .ok_or_else(|| Failure::not_found(&target))?;
                stored.streams.insert(name.clone(), content.clone());
                Ok(OperationResponse::no_content(position))
            }
            (OperationKind::Unlink { navigation, target: linked }, _) => {
                let stored = state
                    .records
                    .get_mut(&target)
                    .ok_or_else(|| Failure::not_found(&target))?;
                let targets = stored.links.entry(navigation.clone()).or_default();
                let before = targets.len();
                targets.retain(|t| t != linked);
                if targets.len() == before {
                    return Err(Failure::new(404, format!("{linked} is not linked from {target}")));
                }
                Ok(OperationResponse::no_content(position))
            }
            _ => Err(Failure::new(400, "payload does not match the operation")),
        }
    }

    fn create(
        &self,
        state: &mut ServiceState,
        position: u32,
        entity_set: &str,
        record: &WireRecord,
        created: &HashMap<u32, String>,
    ) -> Result<OperationResponse, Failure> {
        let ty = self
            .metadata
            .entity_set_type(entity_set)
            .map_err(|_| Failure::new(404, format!("no entity set {entity_set}")))?;
        let mut stored = new_record(state, entity_set, &record.type_name);
        stored
            .properties
            .extend(record.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        let key = allocate_key(state, entity_set, ty.keys.first(), &mut stored.properties);
        let address = format!("{entity_set}({key})");
        if state.records.contains_key(&address) {
            return Err(Failure::new(409, format!("{address} already exists")));
        }
        bind(state, &mut stored, record, created)?;
        let wire = self.to_wire(&address, &stored);
        state.records.insert(address, stored);
        Ok(OperationResponse::created(position, wire))
    }

    fn to_wire(&self, address: &str, stored: &StoredRecord) -> WireEntity {
        let mut wire = WireEntity::new(stored.type_name.clone())
            .with_id(address)
            .with_etag(stored.etag());
        wire.properties = stored
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let media_entity = self
            .metadata
            .entity_type(&stored.type_name)
            .map(|ty| ty.has_stream)
            .unwrap_or(false);
        if media_entity {
            wire.media = Some(MediaInfo {
                read_link: Some(format!("{address}/{MEDIA_SEGMENT}")),
                content_type: stored.media.as_ref().and_then(|m| m.content_type.clone()),
                etag: Some(stored.media_etag()),
            });
        }
        for name in stored.streams.keys() {
            wire.stream_links
                .insert(name.clone(), format!("{address}/{name}"));
        }
        wire
    }

    fn wires<'a>(
        &self,
        state: &ServiceState,
        addresses: impl IntoIterator<Item = &'a String>,
    ) -> Vec<WireEntity> {
        addresses
            .into_iter()
            .filter_map(|address| {
                state
                    .records
                    .get(address)
                    .map(|stored| self.to_wire(address, stored))
            })
            .collect()
    }
}

impl Transport for InMemoryService {
    fn submit(&self, operation: &Operation) -> TransportResult<OperationResponse> {
        self.check_connected()?;
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Ok(self
            .process(&mut state, operation, &HashMap::new())
            .unwrap_or_else(|failure| failure.into_response(operation.position)))
    }

    fn submit_batch(&self, batch: &BatchRequest) -> TransportResult<BatchResponse> {
        self.check_connected()?;
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let mut working = state.clone();
        let mut created = HashMap::new();
        let mut items = Vec::with_capacity(batch.len());

        for operation in &batch.operations {
            match self.process(&mut working, operation, &created) {
                Ok(response) => {
                    if operation.kind == OperationKind::Create {
                        if let Some(address) = response.address() {
                            created.insert(operation.position, address.to_string());
                        }
                    }
                    items.push(response);
                }
                Err(failure) => {
                    debug!(
                        position = operation.position,
                        status = failure.status,
                        "rolling back changeset"
                    );
                    let message = failure.message.clone();
                    let status = failure.status;
                    return Ok(BatchResponse::rejected(
                        status,
                        message,
                        vec![failure.into_response(operation.position)],
                    ));
                }
            }
        }

        *state = working;
        Ok(BatchResponse::accepted(items))
    }

    fn fetch_entity(&self, uri: &str) -> TransportResult<Option<WireEntity>> {
        self.check_connected()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (path, _) = split_query(uri);
        let state = self.state.lock();
        match path.split_once('/') {
            None => Ok(state
                .records
                .get(path)
                .map(|stored| self.to_wire(path, stored))),
            Some((address, navigation)) => {
                let target = state
                    .records
                    .get(address)
                    .and_then(|stored| stored.links.get(navigation))
                    .and_then(|targets| targets.first());
                Ok(target.and_then(|target| self.wires(&state, [target]).pop()))
            }
        }
    }

    fn fetch_collection(&self, uri: &str) -> TransportResult<Vec<WireEntity>> {
        self.check_connected()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (path, query) = split_query(uri);
        let state = self.state.lock();

        let mut entities = match path.split_once('/') {
            Some((address, navigation)) => {
                let stored = state
                    .records
                    .get(address)
                    .ok_or_else(|| TransportError::rejected(404, format!("no entity at {address}")))?;
                self.wires(&state, stored.links.get(navigation).into_iter().flatten())
            }
            None => {
                if self.metadata.entity_set_type(path).is_err() {
                    return Err(TransportError::rejected(404, format!("no entity set {path}")));
                }
                let mut members: Vec<(&String, &StoredRecord)> = state
                    .records
                    .iter()
                    .filter(|(_, stored)| stored.set == path)
                    .collect();
                members.sort_by_key(|(_, stored)| stored.sequence);
                members
                    .into_iter()
                    .map(|(address, stored)| self.to_wire(address, stored))
                    .collect()
            }
        };

        if let Some(skip) = query_number(query, "$skip") {
            entities = entities.into_iter().skip(skip).collect();
        }
        if let Some(top) = query_number(query, "$top") {
            entities.truncate(top);
        }
        Ok(entities)
    }

    fn fetch_stream(&self, uri: &str) -> TransportResult<StreamPayload> {
        self.check_connected()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let missing = || TransportError::rejected(404, format!("no stream at {uri}"));
        let (address, name) = uri.rsplit_once('/').ok_or_else(missing)?;
        let state = self.state.lock();
        let stored = state.records.get(address).ok_or_else(missing)?;
        let payload = if name == MEDIA_SEGMENT {
            stored.media.clone()
        } else {
            stored.streams.get(name).cloned()
        };
        payload.ok_or_else(missing)
    }

    fn invoke(&self, uri: &str, operation: &str, parameters: &Json) -> TransportResult<Json> {
        self.check_connected()?;
        self.invocations
            .lock()
            .push((uri.to_string(), operation.to_string()));
        Ok(json!({
            "operation": operation,
            "target": uri,
            "parameters": parameters,
        }))
    }
}

fn new_record(state: &mut ServiceState, set: &str, type_name: &str) -> StoredRecord {
    state.next_sequence += 1;
    StoredRecord {
        set: set.to_string(),
        type_name: type_name.to_string(),
        sequence: state.next_sequence,
        properties: Map::new(),
        links: BTreeMap::new(),
        version: 1,
        media: None,
        media_version: 0,
        streams: BTreeMap::new(),
    }
}

/// Key literal for a new record, assigning an integer when none is given.
fn allocate_key(
    state: &mut ServiceState,
    set: &str,
    key_property: Option<&String>,
    properties: &mut Map<String, Json>,
) -> String {
    if let Some(value) = key_property.and_then(|name| properties.get(name)) {
        match value {
            Json::Null => {}
            Json::String(text) => return format!("'{}'", text.replace('\'', "''")),
            other => return other.to_string(),
        }
    }
    let key = loop {
        let counter = state.next_keys.entry(set.to_string()).or_insert(0);
        *counter += 1;
        let candidate = *counter;
        if !state.records.contains_key(&format!("{set}({candidate})")) {
            break candidate;
        }
    };
    if let Some(name) = key_property {
        properties.insert(name.clone(), Json::from(key));
    }
    key.to_string()
}

fn lookup<'a>(state: &'a ServiceState, address: &str) -> Result<&'a StoredRecord, Failure> {
    state
        .records
        .get(address)
        .ok_or_else(|| Failure::not_found(address))
}

fn check_if_match(if_match: Option<&str>, current: &str) -> Result<(), Failure> {
    match if_match {
        Some(tag) if tag != "*" && tag != current => Err(Failure::new(
            412,
            format!("precondition failed: expected {tag}, found {current}"),
        )),
        _ => Ok(()),
    }
}

fn bind(
    state: &ServiceState,
    stored: &mut StoredRecord,
    record: &WireRecord,
    created: &HashMap<u32, String>,
) -> Result<(), Failure> {
    for (name, binding) in &record.bindings {
        let mut targets = Vec::with_capacity(binding.targets.len());
        for target in &binding.targets {
            let address = match target {
                LinkTarget::Address(address) => address.clone(),
                LinkTarget::Position(position) => created.get(position).cloned().ok_or_else(|| {
                    Failure::new(400, format!("unknown back-reference ${position}"))
                })?,
            };
            if !state.records.contains_key(&address) {
                return Err(Failure::new(400, format!("link target {address} does not exist")));
            }
            targets.push(address);
        }
        match binding.cardinality {
            Cardinality::Single if targets.is_empty() => {
                stored.links.remove(name);
            }
            Cardinality::Single => {
                stored.links.insert(name.clone(), targets);
            }
            Cardinality::Collection => {
                let existing = stored.links.entry(name.clone()).or_default();
                for target in targets {
                    if !existing.contains(&target) {
                        existing.push(target);
                    }
                }
            }
        }
    }
    Ok(())
}

fn split_query(uri: &str) -> (&str, &str) {
    uri.split_once('?').unwrap_or((uri, ""))
}

fn query_number(query: &str, option: &str) -> Option<usize> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == option)
        .and_then(|(_, value)| value.parse().ok())
}
