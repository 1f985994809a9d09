//! Submission of a commit plan and application of the responses.
//!
//! Batched execution is all or nothing: entities are only touched once
//! the whole changeset has been accepted. Sequential execution applies
//! each response as it arrives; if a later operation fails, what was
//! already accepted stays committed and is reflected locally.

use super::planner::{CommitPlan, PlannedOperation};
use crate::entity::{CachedLink, EntityRef, LinkChange};
use crate::error::{CoreError, CoreResult};
use crate::session::SessionInner;
use crate::transport::TransportError;
use crate::types::EntityStatus;
use entilink_protocol::{
    BatchRequest, MediaInfo, OperationKind, OperationResponse, ProtocolError, WireEntity,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Counters kept while a plan is executed, also on failure.
#[derive(Debug, Default)]
pub(crate) struct Progress {
    pub(crate) submissions: usize,
    pub(crate) committed: usize,
}

/// Submits the whole plan as one atomic changeset.
pub(crate) fn execute_batched(
    session: &SessionInner,
    plan: &CommitPlan,
    progress: &mut Progress,
) -> CoreResult<()> {
    let batch = BatchRequest::new(plan.wire_operations());
    progress.submissions += 1;
    let response = session.transport.submit_batch(&batch)?;

    if !response.is_accepted() {
        let reason = response
            .error
            .clone()
            .unwrap_or_else(|| format!("changeset rejected with status {}", response.status));
        return Err(CoreError::transaction_aborted(reason));
    }
    if let Some(failed) = response.first_failure() {
        return Err(CoreError::transaction_aborted(format!(
            "operation {} failed with status {}: {}",
            failed.position,
            failed.status,
            failed.error.as_deref().unwrap_or("no message")
        )));
    }

    let mut items = Vec::with_capacity(plan.len());
    for planned in &plan.operations {
        let item = response.item(planned.operation.position);
        if planned.operation.kind == OperationKind::Create
            && item.and_then(OperationResponse::address).is_none()
        {
            return Err(ProtocolError::invalid_structure(format!(
                "create at position {} returned no address",
                planned.operation.position
            ))
            .into());
        }
        items.push(item);
    }

    for (planned, item) in plan.operations.iter().zip(items) {
        apply(session, planned, item)?;
        progress.committed += 1;
    }
    Ok(())
}

/// Submits the plan one operation at a time.
///
/// On failure the entities committed so far are settled in the registry
/// and the error is returned unchanged.
pub(crate) fn execute_sequential(
    session: &SessionInner,
    plan: &CommitPlan,
    progress: &mut Progress,
) -> CoreResult<()> {
    let mut committed = Vec::new();
    let result = submit_each(session, plan, progress, &mut committed);
    if result.is_err() && !committed.is_empty() {
        warn!(
            committed = progress.committed,
            remaining = plan.len() - progress.committed,
            "sequential flush stopped after partial commit"
        );
        settle_partial(session, &committed);
    }
    result
}

fn submit_each(
    session: &SessionInner,
    plan: &CommitPlan,
    progress: &mut Progress,
    committed: &mut Vec<EntityRef>,
) -> CoreResult<()> {
    let mut addresses: HashMap<u32, String> = HashMap::new();

    for planned in &plan.operations {
        let mut operation = planned
            .operation
            .resolve_positions(|position| addresses.get(&position).cloned())?;
        if session.config.use_etags {
            let state = planned.entity.read();
            let current = match operation.kind {
                OperationKind::Update | OperationKind::Delete => state.etag.clone(),
                OperationKind::UpdateMedia => state.media_etag(),
                _ => None,
            };
            if current.is_some() {
                operation.if_match = current;
            }
        }

        progress.submissions += 1;
        let response = session.transport.submit(&operation)?;
        if !response.is_success() {
            return Err(TransportError::rejected(
                response.status,
                response.error.clone().unwrap_or_else(|| "no message".to_string()),
            )
            .into());
        }

        apply(session, planned, Some(&response))?;
        progress.committed += 1;
        if operation.kind == OperationKind::Create {
            if let Some(address) = planned.entity.read().address.clone() {
                addresses.insert(operation.position, address);
            }
        }
        if !committed.iter().any(|e| Arc::ptr_eq(e, &planned.entity)) {
            committed.push(Arc::clone(&planned.entity));
        }
    }
    Ok(())
}

/// Registry state after a partial sequential commit.
///
/// Committed deletions leave the registry; other committed entities are
/// `ATTACHED`, or `CHANGED` if some of their edits are still pending.
fn settle_partial(session: &SessionInner, committed: &[EntityRef]) {
    let mut registry = session.registry.lock();
    for entity in committed {
        if entity.is_removed() {
            registry.detach(entity);
            continue;
        }
        let status = if entity.read().has_pending_edits() {
            EntityStatus::Changed
        } else {
            EntityStatus::Attached
        };
        if registry.set_status(entity, status).is_err() {
            registry.attach(entity, status);
        }
    }
}

/// Reflects one accepted operation on its entity.
fn apply(
    session: &SessionInner,
    planned: &PlannedOperation,
    response: Option<&OperationResponse>,
) -> CoreResult<()> {
    let entity = &planned.entity;
    match &planned.operation.kind {
        OperationKind::Create | OperationKind::Update => {
            apply_record(session, planned, response)?;
        }
        OperationKind::Delete => {
            {
                let mut state = entity.write();
                state.clear_pending();
                state.removed = true;
            }
            session.registry.lock().detach(entity);
        }
        OperationKind::UpdateMedia => {
            let mut state = entity.write();
            state.media_change = None;
            if let Some(etag) = response.and_then(|r| r.etag.clone()) {
                let snapshot = state
                    .snapshot
                    .get_or_insert_with(|| WireEntity::new(entity.type_name()));
                snapshot.media.get_or_insert_with(MediaInfo::default).etag = Some(etag);
            }
        }
        OperationKind::UpdateStream(name) => {
            entity.write().stream_changes.remove(name);
        }
        OperationKind::Unlink { navigation, target } => {
            apply_unlink(entity, navigation, target);
        }
    }
    debug!(
        position = planned.operation.position,
        handle = %entity.id(),
        "applied response"
    );
    Ok(())
}

fn apply_record(
    session: &SessionInner,
    planned: &PlannedOperation,
    response: Option<&OperationResponse>,
) -> CoreResult<()> {
    let entity = &planned.entity;
    let Some(record) = planned.operation.record() else {
        return Ok(());
    };
    let created = planned.operation.kind == OperationKind::Create;

    let returned = match response.and_then(|r| r.entity.clone()) {
        Some(mut wire) => {
            session.prepare_wire(&mut wire, entity.type_name())?;
            Some(wire)
        }
        None => None,
    };
    let address = if created {
        let address = response
            .and_then(OperationResponse::address)
            .ok_or_else(|| ProtocolError::invalid_structure("create response carries no address"))?;
        Some(address.to_string())
    } else {
        None
    };

    let mut snapshot = match returned {
        Some(wire) => wire,
        None => {
            let mut merged = entity
                .read()
                .snapshot
                .clone()
                .unwrap_or_else(|| WireEntity::new(entity.type_name()));
            merged.merge_properties(&record.properties);
            merged
        }
    };
    if snapshot.id.is_none() {
        snapshot.id = address.clone();
    }
    let etag = response
        .and_then(|r| r.etag.clone())
        .or_else(|| snapshot.etag.clone());
    let key = if created {
        session
            .key_of(&snapshot, entity.type_name())?
            .or_else(|| address.as_deref().and_then(crate::identity::key_from_address))
    } else {
        None
    };

    {
        let mut state = entity.write();
        state.snapshot = Some(snapshot);
        if etag.is_some() {
            state.etag = etag;
        }
        state.property_cache.clear();
        for name in record.properties.keys() {
            state.property_changes.remove(name);
        }
        for name in record.bindings.keys() {
            let change = state.link_changes.remove(name);
            match change {
                Some(LinkChange::Single(target)) => {
                    state.link_cache.insert(name.clone(), CachedLink::Single(target));
                }
                // Unbinds follow as their own operations.
                Some(LinkChange::Collection { removed, .. }) if !removed.is_empty() => {
                    state.link_changes.insert(
                        name.clone(),
                        LinkChange::Collection {
                            targets: Vec::new(),
                            removed,
                        },
                    );
                    state.link_cache.remove(name);
                }
                _ => {
                    state.link_cache.remove(name);
                }
            }
        }
        if created {
            state.address = address;
            state.identity = state.identity.with_key(key);
        }
    }

    if created {
        session.registry.lock().rekey(entity);
        session.remember(entity);
    }
    Ok(())
}

/// Drops one committed unbind from the entity's pending link edits.
fn apply_unlink(entity: &EntityRef, navigation: &str, target: &str) {
    let pending = entity.read().link_changes.get(navigation).cloned();
    let remaining = match pending {
        Some(LinkChange::Collection {
            targets,
            mut removed,
        }) => {
            removed.retain(|r| r.read().address.as_deref() != Some(target));
            (!targets.is_empty() || !removed.is_empty())
                .then_some(LinkChange::Collection { targets, removed })
        }
        other => other,
    };

    let mut state = entity.write();
    match remaining {
        Some(change) => {
            state.link_changes.insert(navigation.to_string(), change);
        }
        None => {
            state.link_changes.remove(navigation);
        }
    }
    state.link_cache.remove(navigation);
}
