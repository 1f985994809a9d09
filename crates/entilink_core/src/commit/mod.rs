//! Commit planning and execution.

mod executor;
mod planner;
mod report;

pub use report::{FlushReport, SessionStats};

use crate::config::CommitMode;
use crate::error::{CoreError, CoreResult};
use crate::session::SessionInner;
use entilink_protocol::OperationKind;
use executor::{execute_batched, execute_sequential, Progress};
use planner::{CommitPlan, Planner};
use std::time::Instant;
use tracing::{info, warn};

/// Plans and submits every pending edit tracked by the session.
///
/// On success the registry is cleared. On failure a batched flush leaves
/// every entity as it was; a sequential flush keeps what was committed.
pub(crate) fn flush(session: &SessionInner, mode: CommitMode) -> CoreResult<FlushReport> {
    let _serialized = session.flush_lock.lock();
    let started = Instant::now();
    info!(
        mode = mode.as_str(),
        tracked = session.registry.lock().len(),
        "flush started"
    );

    let plan = match Planner::new(session)
        .plan()
        .and_then(|plan| check_limits(session, mode, &plan).map(|()| plan))
    {
        Ok(plan) => plan,
        Err(err) => {
            warn!(error = %err, "flush aborted during planning");
            session.stats.write().record_failure(0, 0, &err.to_string());
            return Err(err);
        }
    };

    let mut progress = Progress::default();
    if !plan.is_empty() {
        let result = match mode {
            CommitMode::Batched => execute_batched(session, &plan, &mut progress),
            CommitMode::Sequential => execute_sequential(session, &plan, &mut progress),
        };
        if let Err(err) = result {
            warn!(
                mode = mode.as_str(),
                submissions = progress.submissions,
                committed = progress.committed,
                error = %err,
                "flush failed"
            );
            session.stats.write().record_failure(
                progress.committed,
                progress.submissions,
                &err.to_string(),
            );
            return Err(err);
        }
    }

    session.registry.lock().detach_all();
    let report = FlushReport {
        mode,
        operations: plan.len(),
        submissions: progress.submissions,
        created: plan.count(|kind| *kind == OperationKind::Create),
        updated: plan.count(|kind| {
            matches!(
                kind,
                OperationKind::Update
                    | OperationKind::UpdateMedia
                    | OperationKind::UpdateStream(_)
                    | OperationKind::Unlink { .. }
            )
        }),
        deleted: plan.count(|kind| *kind == OperationKind::Delete),
        deferred_links: plan.deferred_links,
        duration: started.elapsed(),
    };
    info!(
        mode = mode.as_str(),
        operations = report.operations,
        submissions = report.submissions,
        deferred = report.deferred_links,
        elapsed_ms = report.duration.as_millis() as u64,
        "flush finished"
    );
    session.stats.write().record_success(&report);
    Ok(report)
}

fn check_limits(session: &SessionInner, mode: CommitMode, plan: &CommitPlan) -> CoreResult<()> {
    match session.config.max_batch_operations {
        Some(limit) if mode == CommitMode::Batched && plan.len() > limit => {
            Err(CoreError::illegal_argument(format!(
                "flush needs {} operations, batches are limited to {limit}",
                plan.len()
            )))
        }
        _ => Ok(()),
    }
}
