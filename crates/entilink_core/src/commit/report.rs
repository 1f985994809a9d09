//! Flush outcomes and session statistics.

use crate::config::CommitMode;
use std::time::{Duration, Instant};

/// Summary of one successful flush.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    /// Strategy used.
    pub mode: CommitMode,
    /// Operations planned.
    pub operations: usize,
    /// Network round-trips made.
    pub submissions: usize,
    /// Entities created.
    pub created: usize,
    /// Update, media, stream and unlink operations sent.
    pub updated: usize,
    /// Entities deleted.
    pub deleted: usize,
    /// Link updates that had to wait for the main traversal.
    pub deferred_links: usize,
    /// Wall-clock time spent.
    pub duration: Duration,
}

impl FlushReport {
    pub(crate) fn empty(mode: CommitMode) -> Self {
        Self {
            mode,
            operations: 0,
            submissions: 0,
            created: 0,
            updated: 0,
            deleted: 0,
            deferred_links: 0,
            duration: Duration::ZERO,
        }
    }

    /// Returns true if nothing had to be sent.
    pub fn is_empty(&self) -> bool {
        self.operations == 0
    }
}

/// Statistics accumulated across the flushes of a session.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Flushes that completed.
    pub flushes: u64,
    /// Flushes that failed, during planning or submission.
    pub failed_flushes: u64,
    /// Operations accepted by the service.
    pub operations_committed: u64,
    /// Network round-trips made by flushes.
    pub submissions: u64,
    /// When the last flush finished.
    pub last_flush: Option<Instant>,
    /// Message of the last failure.
    pub last_error: Option<String>,
}

impl SessionStats {
    pub(crate) fn record_success(&mut self, report: &FlushReport) {
        self.flushes += 1;
        self.operations_committed += report.operations as u64;
        self.submissions += report.submissions as u64;
        self.last_flush = Some(Instant::now());
        self.last_error = None;
    }

    pub(crate) fn record_failure(&mut self, committed: usize, submissions: usize, error: &str) {
        self.failed_flushes += 1;
        self.operations_committed += committed as u64;
        self.submissions += submissions as u64;
        self.last_flush = Some(Instant::now());
        self.last_error = Some(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accumulate() {
        let mut stats = SessionStats::default();
        let report = FlushReport {
            operations: 3,
            submissions: 1,
            created: 2,
            updated: 1,
            ..FlushReport::empty(CommitMode::Batched)
        };
        stats.record_success(&report);
        stats.record_failure(1, 2, "rejected");
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.operations_committed, 4);
        assert_eq!(stats.submissions, 3);
        assert_eq!(stats.last_error.as_deref(), Some("rejected"));

        stats.record_success(&FlushReport::empty(CommitMode::Sequential));
        assert!(stats.last_error.is_none());
    }
}
