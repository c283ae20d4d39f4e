//! Co-residency grouping by iterative peeling
//!
//! The first instance left in the pool is locked while every other pool
//! member is probed. Instances whose metric exceeds the threshold form a
//! group with the locked instance and leave the pool together with it.
//! Members without a confident verdict are re-probed under the same lock for
//! a bounded number of follow-up rounds; after that they stay in the pool for
//! a later lock. A lock whose first pass or reverification never completes a
//! round is tried again before any other instance takes its place.

use crate::error::{DriverError, Result};
use crate::round::{InstanceHandle, LockOutcome, ProbeDriver};
use cohost_core::{DriverConfig, Group, GroupingConfig, GroupingReport, InstanceId, Verdict};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// What came of classifying a pool under one lock
enum Classification {
    /// At least one round completed; these exceeded the threshold
    Done(Vec<InstanceHandle>),
    /// No round under this lock completed
    Incomplete,
    /// The locked instance was dropped as unreachable
    LockUnreachable,
}

/// Per-run bookkeeping
struct RunState {
    report: GroupingReport,
    failures: HashMap<InstanceId, u32>,
    unreachable: HashSet<InstanceId>,
    max_failures: u32,
    next_round: u64,
}

impl RunState {
    fn next_round(&mut self) -> u64 {
        let round = self.next_round;
        self.next_round += 1;
        self.report.rounds += 1;
        round
    }

    /// Count a failed call; true once the instance is unreachable
    ///
    /// A failure no retry can fix exhausts the budget at once.
    fn record_failure(&mut self, id: &InstanceId, retryable: bool) -> bool {
        let count = self.failures.entry(id.clone()).or_insert(0);
        *count = if retryable {
            *count + 1
        } else {
            self.max_failures
        };
        if *count >= self.max_failures && self.unreachable.insert(id.clone()) {
            warn!("Marking {} unreachable after {} failed calls", id, count);
            self.report.unreachable.push(id.clone());
        }
        self.unreachable.contains(id)
    }
}

/// Partitions instances into co-resident groups
#[derive(Debug, Clone)]
pub struct CoResidencyGrouper {
    driver: ProbeDriver,
    threshold: f64,
    reverify: bool,
}

impl CoResidencyGrouper {
    /// Build from configuration; fails when no threshold is configured
    pub fn new(driver: DriverConfig, grouping: &GroupingConfig) -> cohost_core::Result<Self> {
        driver.validate()?;
        Ok(Self::with_threshold(
            ProbeDriver::new(driver),
            grouping.require_threshold()?,
            grouping.reverify,
        ))
    }

    pub fn with_threshold(driver: ProbeDriver, threshold: f64, reverify: bool) -> Self {
        Self {
            driver,
            threshold,
            reverify,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Partition `instances` into co-resident groups
    ///
    /// Every input instance ends up in exactly one group or in the
    /// report's unreachable list.
    pub async fn group(&self, instances: Vec<InstanceHandle>) -> Result<GroupingReport> {
        let mut seen = HashSet::new();
        for handle in &instances {
            if !seen.insert(handle.id.clone()) {
                return Err(DriverError::InvalidInput(format!(
                    "Duplicate instance {}",
                    handle.id
                )));
            }
        }

        info!(
            "Grouping {} instances with threshold {}",
            instances.len(),
            self.threshold
        );

        let mut state = RunState {
            report: GroupingReport::new(self.threshold),
            failures: HashMap::new(),
            unreachable: HashSet::new(),
            max_failures: self.driver.config().max_transport_failures,
            next_round: 0,
        };
        let mut pool = instances;

        while let Some(lock) = pool.first().cloned() {
            if pool.len() == 1 {
                debug!("{} is the last instance, closing its group", lock.id);
                state.report.groups.push(Group::singleton(lock.id.clone()));
                pool.clear();
                break;
            }

            let others = pool[1..].to_vec();
            let members = match self.classify(&lock, others, &mut state).await {
                Classification::Done(candidates) if self.reverify && !candidates.is_empty() => {
                    debug!(
                        "Reverifying {} candidates under {}",
                        candidates.len(),
                        lock.id
                    );
                    match self.classify(&lock, candidates, &mut state).await {
                        Classification::Done(confirmed) => Some(confirmed),
                        Classification::Incomplete => {
                            debug!("Reverification under {} incomplete, retrying", lock.id);
                            None
                        }
                        Classification::LockUnreachable => None,
                    }
                }
                Classification::Done(candidates) => Some(candidates),
                Classification::Incomplete | Classification::LockUnreachable => None,
            };

            if let Some(members) = members {
                let ids: HashSet<&InstanceId> = members.iter().map(|h| &h.id).collect();
                let mut group = Group::singleton(lock.id.clone());
                group.members.extend(
                    pool.iter()
                        .filter(|h| ids.contains(&h.id))
                        .map(|h| h.id.clone()),
                );

                info!(
                    "Group under {}: {} instances",
                    group.lock,
                    group.members.len()
                );
                pool.retain(|h| !group.contains(&h.id));
                state.report.groups.push(group);
            }

            pool.retain(|h| !state.unreachable.contains(&h.id));
        }

        info!(
            "Grouping finished: {} groups, {} unreachable, {} rounds",
            state.report.groups.len(),
            state.report.unreachable.len(),
            state.report.rounds
        );
        Ok(state.report)
    }

    /// Probe `targets` under a lock on `lock`, with follow-up rounds for
    /// targets left without a confident verdict
    async fn classify(
        &self,
        lock: &InstanceHandle,
        targets: Vec<InstanceHandle>,
        state: &mut RunState,
    ) -> Classification {
        let retries = self.driver.config().max_round_retries;
        let mut undetermined = targets;
        let mut exceeded = Vec::new();
        let mut completed = false;

        for _ in 0..=retries {
            if undetermined.is_empty() {
                break;
            }

            let round = state.next_round();
            let report = self.driver.lock_and_probe(lock, &undetermined, round).await;

            if let LockOutcome::Failed { error } = &report.lock_outcome {
                debug!("Round {}: no contention from {}: {}", round, lock.id, error);
                if state.record_failure(&lock.id, error.is_retryable()) {
                    return Classification::LockUnreachable;
                }
                continue;
            }

            if report.aborted {
                state.report.aborted_rounds += 1;
            } else {
                completed = true;
            }

            let mut next = Vec::new();
            for (handle, observation) in undetermined.into_iter().zip(report.observations) {
                if observation.call_failed {
                    if !state.record_failure(&handle.id, observation.retryable) {
                        next.push(handle);
                    }
                    continue;
                }
                if report.aborted {
                    next.push(handle);
                    continue;
                }

                match observation.result.classify(self.threshold) {
                    Verdict::CoResident => exceeded.push(handle),
                    Verdict::NotCoResident => {}
                    Verdict::Unknown(reason) => {
                        debug!("Round {}: {} undetermined: {}", round, handle.id, reason);
                        next.push(handle);
                    }
                }
            }
            undetermined = next;
        }

        if !undetermined.is_empty() {
            debug!(
                "{} instances left undetermined under {}",
                undetermined.len(),
                lock.id
            );
        }

        if completed {
            Classification::Done(exceeded)
        } else {
            Classification::Incomplete
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, fast_driver, handles};
    use cohost_dev::{setup_test_logging, two_by_two_cluster, Fault, SimulatedCluster};
    use std::collections::BTreeSet;

    fn grouper() -> CoResidencyGrouper {
        CoResidencyGrouper::with_threshold(fast_driver(), 350.0, true)
    }

    fn as_sets(groups: &[Group]) -> BTreeSet<BTreeSet<InstanceId>> {
        groups
            .iter()
            .map(|g| g.members.iter().cloned().collect())
            .collect()
    }

    fn truth(cluster: &SimulatedCluster) -> BTreeSet<BTreeSet<InstanceId>> {
        cluster
            .ground_truth()
            .into_iter()
            .map(|host| host.into_iter().collect())
            .collect()
    }

    #[tokio::test]
    async fn test_two_by_two() {
        setup_test_logging();
        let cluster = two_by_two_cluster().unwrap();

        let report = grouper().group(handles(&cluster)).await.unwrap();

        assert_eq!(report.groups.len(), 2);
        assert_eq!(report.groups[0].lock.as_str(), "a");
        assert_eq!(
            report.groups[0].members,
            vec![InstanceId::from("a"), InstanceId::from("b")]
        );
        assert_eq!(
            report.groups[1].members,
            vec![InstanceId::from("c"), InstanceId::from("d")]
        );
        assert!(report.is_partition_of(&cluster.instance_ids()));
    }

    #[tokio::test]
    async fn test_recovers_ground_truth() {
        let cluster = SimulatedCluster::builder()
            .uniform_hosts(3, 3)
            .host(["solo"])
            .build()
            .unwrap();

        let report = grouper().group(handles(&cluster)).await.unwrap();

        assert_eq!(as_sets(&report.groups), truth(&cluster));
        assert!(report.is_partition_of(&cluster.instance_ids()));
        assert!(report.unreachable.is_empty());
    }

    #[tokio::test]
    async fn test_empty_pool() {
        let report = grouper().group(Vec::new()).await.unwrap();
        assert!(report.groups.is_empty());
        assert_eq!(report.rounds, 0);
    }

    #[tokio::test]
    async fn test_single_instance_needs_no_lock() {
        let cluster = SimulatedCluster::builder().host(["only"]).build().unwrap();

        let report = grouper().group(handles(&cluster)).await.unwrap();

        assert_eq!(report.groups, vec![Group::singleton("only".into())]);
        assert_eq!(cluster.lock_calls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_instances_rejected() {
        let cluster = two_by_two_cluster().unwrap();
        let mut all = handles(&cluster);
        all.push(all[0].clone());

        let err = grouper().group(all).await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_order_independent_partition() {
        let cluster = SimulatedCluster::builder()
            .uniform_hosts(2, 3)
            .build()
            .unwrap();
        let forward = handles(&cluster);
        let mut reversed = forward.clone();
        reversed.reverse();

        let first = grouper().group(forward).await.unwrap();
        let second = grouper().group(reversed).await.unwrap();

        assert_eq!(as_sets(&first.groups), as_sets(&second.groups));
    }

    #[tokio::test]
    async fn test_unreachable_instance_is_reported() {
        let cluster = two_by_two_cluster().unwrap();
        cluster.inject_fault(&"c".into(), Fault::Unreachable);

        let report = grouper().group(handles(&cluster)).await.unwrap();

        assert_eq!(report.unreachable, vec![InstanceId::from("c")]);
        assert_eq!(
            as_sets(&report.groups),
            [vec!["a", "b"], vec!["d"]]
                .into_iter()
                .map(|g| g.into_iter().map(InstanceId::from).collect())
                .collect()
        );
        assert!(report.is_partition_of(&cluster.instance_ids()));
    }

    #[tokio::test]
    async fn test_transient_failure_does_not_affect_others() {
        let cluster = two_by_two_cluster().unwrap();
        cluster.inject_fault(&"b".into(), Fault::FailCalls(1));

        let report = grouper().group(handles(&cluster)).await.unwrap();

        assert_eq!(as_sets(&report.groups), truth(&cluster));
        assert!(report.unreachable.is_empty());
    }

    #[tokio::test]
    async fn test_lock_failure_retries_same_lock() {
        let cluster = two_by_two_cluster().unwrap();
        cluster.inject_fault(&"a".into(), Fault::FailLocks(1));

        let report = grouper().group(handles(&cluster)).await.unwrap();

        assert_eq!(report.groups[0].lock.as_str(), "a");
        assert_eq!(as_sets(&report.groups), truth(&cluster));
    }

    #[tokio::test]
    async fn test_incomplete_reverification_keeps_lock() {
        let cluster = two_by_two_cluster().unwrap();
        // The first pass under a succeeds; every reverification lock times out
        cluster.inject_fault(&"a".into(), Fault::LockOutage { after: 1, count: 3 });
        let config = DriverConfig {
            max_transport_failures: 10,
            ..fast_config()
        };
        let grouper = CoResidencyGrouper::with_threshold(ProbeDriver::new(config), 350.0, true);

        let report = grouper.group(handles(&cluster)).await.unwrap();

        assert_eq!(report.groups[0].lock.as_str(), "a");
        assert_eq!(as_sets(&report.groups), truth(&cluster));
        assert!(report.unreachable.is_empty());
        assert!(report.is_partition_of(&cluster.instance_ids()));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_marks_unreachable_at_once() {
        let cluster = two_by_two_cluster().unwrap();
        cluster.inject_fault(&"c".into(), Fault::NotAnAgent);

        let report = grouper().group(handles(&cluster)).await.unwrap();

        assert_eq!(report.unreachable, vec![InstanceId::from("c")]);
        // One round under a, one reverification, d closes alone
        assert_eq!(report.rounds, 2);
        assert!(report.is_partition_of(&cluster.instance_ids()));
    }

    #[tokio::test]
    async fn test_unlockable_instance_is_dropped() {
        let cluster = two_by_two_cluster().unwrap();
        cluster.inject_fault(&"a".into(), Fault::FailLocks(100));

        let report = grouper().group(handles(&cluster)).await.unwrap();

        assert_eq!(report.unreachable, vec![InstanceId::from("a")]);
        assert!(report.is_partition_of(&cluster.instance_ids()));
        assert!(report.group_of(&"c".into()).is_some_and(|g| g.contains(&"d".into())));
    }

    #[tokio::test]
    async fn test_short_batches_stay_in_pool() {
        let cluster = two_by_two_cluster().unwrap();
        cluster.inject_fault(&"b".into(), Fault::ShortBatch(5));

        let report = grouper().group(handles(&cluster)).await.unwrap();

        // b never yields a confident verdict, so it ends up alone
        assert!(report.group_of(&"b".into()).is_some_and(|g| g.len() == 1));
        assert!(!report.group_of(&"a".into()).is_some_and(|g| g.contains(&"b".into())));
        assert!(report.is_partition_of(&cluster.instance_ids()));
        assert!(report.unreachable.is_empty());
    }

    #[tokio::test]
    async fn test_round_accounting() {
        let cluster = two_by_two_cluster().unwrap();

        let without = CoResidencyGrouper::with_threshold(fast_driver(), 350.0, false)
            .group(handles(&cluster))
            .await
            .unwrap();
        // One round per lock on {a,b,c,d} and {c,d}
        assert_eq!(without.rounds, 2);

        let with = grouper().group(handles(&cluster)).await.unwrap();
        assert_eq!(with.rounds, 4);
    }

    #[test]
    fn test_threshold_required() {
        let err = CoResidencyGrouper::new(fast_config(), &GroupingConfig::default()).unwrap_err();
        assert!(matches!(err, cohost_core::Error::InvalidConfiguration(_)));
    }
}
