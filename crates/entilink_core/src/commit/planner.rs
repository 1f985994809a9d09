//! Dependency-ordered commit planning.
//!
//! Each dirty entity is visited depth first. Link targets that still need
//! an operation of their own are visited before the entity linking to
//! them, so by the time an entity's record is serialized every new target
//! already has a commit position it can be referenced by (`$n`). Targets
//! that are still on the traversal stack (cycles) cannot be referenced
//! yet; those links become deferred updates, planned after the traversal.

use crate::entity::{EntityRef, LinkChange};
use crate::error::{CoreError, CoreResult};
use crate::session::SessionInner;
use crate::types::{EntityStatus, HandleId};
use entilink_codec::Value;
use entilink_protocol::{Cardinality, LinkTarget, Operation, OperationKind, StreamPayload, Target, WireRecord};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// One planned operation and the entity it commits.
#[derive(Clone)]
pub(crate) struct PlannedOperation {
    pub(crate) operation: Operation,
    pub(crate) entity: EntityRef,
}

/// The full plan of one flush.
#[derive(Default)]
pub(crate) struct CommitPlan {
    pub(crate) operations: Vec<PlannedOperation>,
    pub(crate) deferred_links: usize,
}

impl CommitPlan {
    pub(crate) fn len(&self) -> usize {
        self.operations.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations in submission order.
    pub(crate) fn wire_operations(&self) -> Vec<Operation> {
        self.operations.iter().map(|p| p.operation.clone()).collect()
    }

    pub(crate) fn count(&self, kind: fn(&OperationKind) -> bool) -> usize {
        self.operations
            .iter()
            .filter(|p| kind(&p.operation.kind))
            .count()
    }
}

/// A navigation edit whose targets had no position yet.
struct PendingLinkUpdate {
    source: EntityRef,
    navigation: String,
    cardinality: Cardinality,
    targets: Vec<EntityRef>,
}

#[derive(Clone, Copy)]
enum Mark {
    Visiting,
    Done { position: Option<u32> },
}

/// Pending state copied out of an entity before planning it.
struct Pending {
    address: Option<String>,
    etag: Option<String>,
    media_etag: Option<String>,
    properties: BTreeMap<String, Value>,
    links: BTreeMap<String, LinkChange>,
    streams: BTreeMap<String, StreamPayload>,
    media: Option<StreamPayload>,
}

impl Pending {
    fn of(entity: &EntityRef) -> Self {
        let state = entity.read();
        Self {
            address: state.address.clone(),
            etag: state.etag.clone(),
            media_etag: state.media_etag(),
            properties: state.property_changes.clone(),
            links: state.link_changes.clone(),
            streams: state.stream_changes.clone(),
            media: state.media_change.clone(),
        }
    }
}

pub(crate) struct Planner<'a> {
    session: &'a SessionInner,
    statuses: HashMap<HandleId, EntityStatus>,
    marks: HashMap<HandleId, Mark>,
    plan: CommitPlan,
    deferred: Vec<PendingLinkUpdate>,
}

impl<'a> Planner<'a> {
    pub(crate) fn new(session: &'a SessionInner) -> Self {
        Self {
            session,
            statuses: HashMap::new(),
            marks: HashMap::new(),
            plan: CommitPlan::default(),
            deferred: Vec::new(),
        }
    }

    /// Plans every pending edit in the registry.
    ///
    /// Nothing is sent; a failure here leaves every entity untouched.
    pub(crate) fn plan(mut self) -> CoreResult<CommitPlan> {
        let tracked = self.session.registry.lock().iterate();
        self.statuses = tracked
            .iter()
            .map(|(entity, status)| (entity.id(), *status))
            .collect();

        for (entity, status) in &tracked {
            let dirty = status.is_dirty()
                || *status == EntityStatus::Changed
                || entity.read().has_pending_edits();
            if dirty {
                self.visit(entity)?;
            }
        }

        for update in std::mem::take(&mut self.deferred) {
            self.plan_deferred(update)?;
        }
        Ok(self.plan)
    }

    fn status(&self, entity: &EntityRef) -> EntityStatus {
        self.statuses.get(&entity.id()).copied().unwrap_or_else(|| {
            if entity.read().address.is_some() {
                EntityStatus::Attached
            } else {
                EntityStatus::New
            }
        })
    }

    fn next_position(&self) -> u32 {
        self.plan.operations.len() as u32 + 1
    }

    fn push(&mut self, entity: &EntityRef, operation: Operation) -> u32 {
        let position = operation.position;
        debug!(
            position,
            handle = %entity.id(),
            method = operation.kind.method(),
            url = %operation.url(),
            "planned operation"
        );
        self.plan.operations.push(PlannedOperation {
            operation,
            entity: entity.clone(),
        });
        position
    }

    fn if_match(&self, etag: Option<String>) -> Option<String> {
        if self.session.config.use_etags {
            etag
        } else {
            None
        }
    }

    fn visit(&mut self, entity: &EntityRef) -> CoreResult<()> {
        if self.marks.contains_key(&entity.id()) {
            return Ok(());
        }
        self.marks.insert(entity.id(), Mark::Visiting);

        let status = self.status(entity);
        let pending = Pending::of(entity);

        if status == EntityStatus::Deleted {
            let Some(address) = pending.address else {
                self.marks.insert(entity.id(), Mark::Done { position: None });
                return Ok(());
            };
            let delete = Operation::delete(self.next_position(), Target::Address(address))
                .with_if_match(self.if_match(pending.etag));
            let position = self.push(entity, delete);
            self.marks.insert(entity.id(), Mark::Done { position: Some(position) });
            return Ok(());
        }

        let record = self.serialize(entity, &pending)?;
        let target = match (&pending.address, status) {
            (Some(address), _) if status != EntityStatus::New => {
                let primary = if record.is_empty() {
                    None
                } else {
                    let update = Operation::update(
                        self.next_position(),
                        Target::Address(address.clone()),
                        record,
                    )
                    .with_if_match(self.if_match(pending.etag.clone()));
                    Some(self.push(entity, update))
                };
                self.marks.insert(entity.id(), Mark::Done { position: primary });
                Target::Address(address.clone())
            }
            _ => {
                let create = Operation::create(self.next_position(), entity.entity_set(), record);
                let position = self.push(entity, create);
                self.marks.insert(entity.id(), Mark::Done { position: Some(position) });
                Target::Position(position)
            }
        };

        // Structured fields and binary content never share an operation.
        if let Some(media) = pending.media {
            let operation = Operation::update_media(self.next_position(), target.clone(), media)
                .with_if_match(self.if_match(pending.media_etag));
            debug!(handle = %entity.id(), "scheduled media follow-up");
            self.push(entity, operation);
        }
        for (name, payload) in pending.streams {
            let operation = Operation::update_stream(self.next_position(), target.clone(), name, payload);
            debug!(handle = %entity.id(), "scheduled stream follow-up");
            self.push(entity, operation);
        }
        if let Target::Address(address) = &target {
            self.plan_unlinks(entity, address, &pending.links);
        }
        Ok(())
    }

    /// Unbinds targets dropped from collection navigations.
    ///
    /// Targets deleted in the same commit lose their links with the delete.
    fn plan_unlinks(
        &mut self,
        entity: &EntityRef,
        address: &str,
        links: &BTreeMap<String, LinkChange>,
    ) {
        for (navigation, change) in links {
            for removed in change.removed() {
                if removed.is_removed() || self.status(removed) == EntityStatus::Deleted {
                    continue;
                }
                let Some(linked) = removed.read().address.clone() else {
                    continue;
                };
                debug!(
                    handle = %entity.id(),
                    navigation = %navigation,
                    target = %linked,
                    "scheduled unlink"
                );
                let operation = Operation::unlink(
                    self.next_position(),
                    Target::Address(address.to_string()),
                    navigation,
                    linked,
                );
                self.push(entity, operation);
            }
        }
    }

    /// Builds the outgoing record of an entity, visiting link targets first.
    fn serialize(&mut self, entity: &EntityRef, pending: &Pending) -> CoreResult<WireRecord> {
        let ty = self.session.metadata.entity_type(entity.type_name())?;
        let mut record = WireRecord::new(entity.type_name());

        for (name, value) in &pending.properties {
            let declared = ty.property_type(name)?;
            let wire = self.session.codec.encode(value, declared).map_err(|e| {
                CoreError::illegal_argument(format!("{}.{name}: {e}", entity.type_name()))
            })?;
            record.properties.insert(name.clone(), wire);
        }

        for (navigation, change) in &pending.links {
            let cardinality = change.cardinality();
            let targets = change.targets();
            if targets.is_empty() {
                if cardinality == Cardinality::Single {
                    record.bind(navigation, cardinality, None);
                }
                continue;
            }

            let mut deferred = Vec::new();
            for target in targets {
                match self.resolve_target(entity, navigation, &target)? {
                    Some(link) => record.bind(navigation, cardinality, Some(link)),
                    None => deferred.push(target),
                }
            }
            if !deferred.is_empty() {
                debug!(
                    handle = %entity.id(),
                    navigation = %navigation,
                    count = deferred.len(),
                    "deferring link update"
                );
                self.deferred.push(PendingLinkUpdate {
                    source: entity.clone(),
                    navigation: navigation.clone(),
                    cardinality,
                    targets: deferred,
                });
            }
        }
        Ok(record)
    }

    /// Picks how `source` refers to `target`, or `None` if it cannot yet.
    fn resolve_target(
        &mut self,
        source: &EntityRef,
        navigation: &str,
        target: &EntityRef,
    ) -> CoreResult<Option<LinkTarget>> {
        let status = self.status(target);
        if target.is_removed() || status == EntityStatus::Deleted {
            return Err(CoreError::illegal_argument(format!(
                "{}.{navigation} links to {} which is being deleted",
                source.type_name(),
                target.id()
            )));
        }

        let dirty = status == EntityStatus::New
            || status == EntityStatus::Changed
            || target.read().has_pending_edits();
        if !dirty {
            if let Some(address) = target.read().address.clone() {
                debug!(handle = %source.id(), navigation, %address, "direct link");
                return Ok(Some(LinkTarget::Address(address)));
            }
        }

        if !self.marks.contains_key(&target.id()) {
            self.visit(target)?;
        }

        if let Some(address) = target.read().address.clone() {
            debug!(handle = %source.id(), navigation, %address, "direct link");
            return Ok(Some(LinkTarget::Address(address)));
        }
        match self.marks.get(&target.id()) {
            Some(Mark::Done {
                position: Some(position),
            }) => {
                debug!(handle = %source.id(), navigation, position, "positional link");
                Ok(Some(LinkTarget::Position(*position)))
            }
            _ => Ok(None),
        }
    }

    fn plan_deferred(&mut self, update: PendingLinkUpdate) -> CoreResult<()> {
        let source_target = self.reference(&update.source).ok_or_else(|| {
            CoreError::illegal_argument(format!(
                "link source {} was never planned",
                update.source.id()
            ))
        })?;

        let mut record = WireRecord::new(update.source.type_name());
        for target in &update.targets {
            let link = match self.reference(target) {
                Some(Target::Address(address)) => LinkTarget::Address(address),
                Some(Target::Position(position)) => LinkTarget::Position(position),
                _ => {
                    return Err(CoreError::illegal_argument(format!(
                        "link target {} was never planned",
                        target.id()
                    )))
                }
            };
            record.bind(&update.navigation, update.cardinality, Some(link));
        }

        // An earlier update of the source in this plan moves its token on.
        let etag = match &source_target {
            Target::Address(_) if !self.has_update(&update.source) => {
                self.if_match(update.source.read().etag.clone())
            }
            _ => None,
        };
        let operation =
            Operation::update(self.next_position(), source_target, record).with_if_match(etag);
        self.push(&update.source, operation);
        self.plan.deferred_links += 1;
        Ok(())
    }

    fn has_update(&self, entity: &EntityRef) -> bool {
        self.plan.operations.iter().any(|planned| {
            planned.operation.kind == OperationKind::Update
                && Arc::ptr_eq(&planned.entity, entity)
        })
    }

    /// Durable address, or the position of the entity's create.
    fn reference(&self, entity: &EntityRef) -> Option<Target> {
        if let Some(address) = entity.read().address.clone() {
            return Some(Target::Address(address));
        }
        match self.marks.get(&entity.id()) {
            Some(Mark::Done {
                position: Some(position),
            }) => Some(Target::Position(*position)),
            _ => None,
        }
    }
}
