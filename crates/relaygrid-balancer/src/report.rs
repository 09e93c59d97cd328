//! Per-node sync outcomes.

use relaygrid_core::FleetError;
use serde::Serialize;

use crate::snapshot::ConfigSnapshot;

/// What happened to one node during propagation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    Applied,
    /// Failed after the rollback point; the previous config is back.
    RolledBack { reason: String },
    /// Could not be reached before anything changed.
    Unreachable { reason: String },
    /// Refused before anything changed, e.g. the rollback point could not
    /// be created.
    Failed { reason: String },
    /// Restore failed; the node's config is unknown.
    Unknown { reason: String },
    /// Not started because the sync was cancelled.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    pub node: String,
    pub reason: String,
}

/// Headline numbers of a sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub applied: usize,
    pub rolled_back: usize,
    pub unreachable: usize,
}

/// Result of one sync pass. Every targeted node lands in exactly one list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Snapshot of the config that was propagated.
    pub snapshot: Option<ConfigSnapshot>,
    pub applied: Vec<String>,
    pub rolled_back: Vec<NodeFailure>,
    pub unreachable: Vec<NodeFailure>,
    pub failed: Vec<NodeFailure>,
    pub unknown: Vec<NodeFailure>,
    pub skipped: Vec<String>,
}

impl SyncReport {
    pub fn record(&mut self, node: &str, outcome: NodeOutcome) {
        let failure = |reason: String| NodeFailure {
            node: node.to_string(),
            reason,
        };
        match outcome {
            NodeOutcome::Applied => self.applied.push(node.to_string()),
            NodeOutcome::RolledBack { reason } => self.rolled_back.push(failure(reason)),
            NodeOutcome::Unreachable { reason } => self.unreachable.push(failure(reason)),
            NodeOutcome::Failed { reason } => self.failed.push(failure(reason)),
            NodeOutcome::Unknown { reason } => self.unknown.push(failure(reason)),
            NodeOutcome::Skipped => self.skipped.push(node.to_string()),
        }
    }

    pub fn counts(&self) -> SyncCounts {
        SyncCounts {
            applied: self.applied.len(),
            rolled_back: self.rolled_back.len(),
            unreachable: self.unreachable.len(),
        }
    }

    pub fn total(&self) -> usize {
        self.applied.len()
            + self.rolled_back.len()
            + self.unreachable.len()
            + self.failed.len()
            + self.unknown.len()
            + self.skipped.len()
    }

    /// Every node reached the new config.
    pub fn is_clean(&self) -> bool {
        self.applied.len() == self.total()
    }

    pub fn has_unknown(&self) -> bool {
        !self.unknown.is_empty()
    }

    /// Nodes needing a human, as errors.
    pub fn escalations(&self) -> Vec<FleetError> {
        self.unknown
            .iter()
            .map(|f| FleetError::SyncRollback {
                node: f.node.clone(),
                reason: f.reason.clone(),
            })
            .collect()
    }

    /// Fold another pass's node lists into this one.
    pub fn merge(&mut self, other: SyncReport) {
        if other.snapshot.is_some() {
            self.snapshot = other.snapshot;
        }
        self.applied.extend(other.applied);
        self.rolled_back.extend(other.rolled_back);
        self.unreachable.extend(other.unreachable);
        self.failed.extend(other.failed);
        self.unknown.extend(other.unknown);
        self.skipped.extend(other.skipped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_escalations() {
        let mut report = SyncReport::default();
        report.record("a", NodeOutcome::Applied);
        report.record("b", NodeOutcome::RolledBack { reason: "validate".into() });
        report.record("c", NodeOutcome::Unreachable { reason: "timeout".into() });
        report.record("d", NodeOutcome::Unknown { reason: "restore".into() });
        report.record("e", NodeOutcome::Skipped);

        assert_eq!(
            report.counts(),
            SyncCounts {
                applied: 1,
                rolled_back: 1,
                unreachable: 1
            }
        );
        assert_eq!(report.total(), 5);
        assert!(!report.is_clean());
        assert!(report.has_unknown());
        let escalations = report.escalations();
        assert_eq!(escalations.len(), 1);
        assert!(escalations[0].needs_escalation());
    }

    #[test]
    fn empty_report_is_clean() {
        assert!(SyncReport::default().is_clean());
    }
}
