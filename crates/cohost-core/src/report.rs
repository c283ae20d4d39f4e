//! Run reports emitted by the driver and persisted by the CLI

use crate::{CandidateSet, Group, InstanceId, SampleStats};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Result of a grouping run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupingReport {
    pub threshold: f64,

    /// Disjoint groups in formation order
    pub groups: Vec<Group>,

    /// Instances excluded after repeated transport failures
    #[serde(default)]
    pub unreachable: Vec<InstanceId>,

    /// Instances never observed (scaled-out mode only)
    #[serde(default)]
    pub unresolved: Vec<InstanceId>,

    /// Probe rounds executed, follow-ups and reverification included
    pub rounds: u32,

    /// Rounds aborted because too many probe calls failed
    pub aborted_rounds: u32,
}

impl GroupingReport {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }

    /// Group containing an instance, if any
    pub fn group_of(&self, id: &InstanceId) -> Option<&Group> {
        self.groups.iter().find(|group| group.contains(id))
    }

    /// Number of grouped instances
    pub fn grouped_count(&self) -> usize {
        self.groups.iter().map(Group::len).sum()
    }

    /// True iff groups, unreachable and unresolved instances together
    /// partition `ids`: every id appears exactly once and nothing else appears.
    pub fn is_partition_of(&self, ids: &[InstanceId]) -> bool {
        let mut seen = HashSet::new();
        let everything = self
            .groups
            .iter()
            .flat_map(|group| group.members.iter())
            .chain(self.unreachable.iter())
            .chain(self.unresolved.iter());

        for id in everything {
            if !seen.insert(id) {
                return false;
            }
        }

        seen.len() == ids.len() && ids.iter().all(|id| seen.contains(id))
    }
}

/// Why a localization search ended without an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NotFoundReason {
    /// Nothing to search
    EmptyPool,
    /// Every candidate was dropped as unreachable
    AllUnreachable,
    /// No candidate set pushed the victim above θ
    NoSetExceeded,
    /// The last remaining candidate did not reproduce the signal
    ConfirmationFailed { candidate: InstanceId, latency_ms: f64 },
    /// The victim could not be timed reliably
    VictimUnmeasurable,
}

impl std::fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotFoundReason::EmptyPool => write!(f, "candidate pool is empty"),
            NotFoundReason::AllUnreachable => write!(f, "every candidate became unreachable"),
            NotFoundReason::NoSetExceeded => write!(f, "no candidate set crossed the threshold"),
            NotFoundReason::ConfirmationFailed {
                candidate,
                latency_ms,
            } => write!(
                f,
                "confirmation of {} failed ({:.2} ms)",
                candidate, latency_ms
            ),
            NotFoundReason::VictimUnmeasurable => write!(f, "victim latency could not be measured"),
        }
    }
}

/// Terminal state of a localization search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LocalizationOutcome {
    Found { instance: InstanceId, latency_ms: f64 },
    NotFound(NotFoundReason),
}

/// Result of a localization search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizationReport {
    pub threshold_ms: f64,

    pub outcome: LocalizationOutcome,

    /// Bisection rounds plus the confirmation round
    pub rounds: u32,

    /// Victim rounds repeated after lock failures or too few victim samples
    #[serde(default)]
    pub retried_rounds: u32,

    /// Pre-screen rounds over candidate sets
    #[serde(default)]
    pub screen_rounds: u32,

    /// Index of the candidate set that was searched
    #[serde(default)]
    pub searched_set: Option<usize>,

    #[serde(default)]
    pub unreachable: Vec<InstanceId>,
}

impl LocalizationReport {
    pub fn found(&self) -> Option<&InstanceId> {
        match &self.outcome {
            LocalizationOutcome::Found { instance, .. } => Some(instance),
            LocalizationOutcome::NotFound(_) => None,
        }
    }

    /// Process exit status: 0 when found, 2 otherwise
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            LocalizationOutcome::Found { .. } => 0,
            LocalizationOutcome::NotFound(_) => 2,
        }
    }
}

/// Candidate sets as written by `prepare-sets` and read by `localize`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CandidateSets {
    pub sets: Vec<CandidateSet>,
}

impl CandidateSets {
    pub fn total_candidates(&self) -> usize {
        self.sets.iter().map(|set| set.instances.len()).sum()
    }
}

/// Baseline statistics of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceBaseline {
    pub instance_id: InstanceId,
    pub stats: SampleStats,
}

/// Result of a baseline measurement
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BaselineReport {
    pub instances: Vec<InstanceBaseline>,

    /// Statistics over every per-instance aggregate
    pub pooled: SampleStats,

    #[serde(default)]
    pub unreachable: Vec<InstanceId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<InstanceId> {
        names.iter().map(|n| InstanceId::new(*n)).collect()
    }

    #[test]
    fn test_partition_check() {
        let mut report = GroupingReport::new(100.0);
        report.groups.push(Group {
            lock: "a".into(),
            members: ids(&["a", "b"]),
        });
        report.groups.push(Group::singleton("c".into()));
        report.unreachable.push("d".into());

        assert!(report.is_partition_of(&ids(&["a", "b", "c", "d"])));
        assert!(!report.is_partition_of(&ids(&["a", "b", "c"])));
        assert!(!report.is_partition_of(&ids(&["a", "b", "c", "d", "e"])));
        assert_eq!(report.grouped_count(), 3);
        assert_eq!(report.group_of(&"b".into()).map(|g| g.lock.as_str()), Some("a"));

        report.groups.push(Group::singleton("b".into()));
        assert!(!report.is_partition_of(&ids(&["a", "b", "c", "d"])));
    }

    #[test]
    fn test_empty_partition() {
        assert!(GroupingReport::new(1.0).is_partition_of(&[]));
    }

    #[test]
    fn test_localization_exit_code() {
        let found = LocalizationReport {
            threshold_ms: 20.0,
            outcome: LocalizationOutcome::Found {
                instance: "x".into(),
                latency_ms: 31.0,
            },
            rounds: 4,
            retried_rounds: 0,
            screen_rounds: 0,
            searched_set: None,
            unreachable: vec![],
        };
        assert_eq!(found.exit_code(), 0);
        assert_eq!(found.found().map(InstanceId::as_str), Some("x"));

        let missing = LocalizationReport {
            outcome: LocalizationOutcome::NotFound(NotFoundReason::EmptyPool),
            ..found
        };
        assert_eq!(missing.exit_code(), 2);
        assert!(missing.found().is_none());

        let json = serde_json::to_value(&missing.outcome).unwrap();
        assert_eq!(json["status"], "not_found");
        assert_eq!(json["reason"], "empty_pool");
    }
}
