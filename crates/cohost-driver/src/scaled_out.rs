//! Grouping behind a single load-balanced endpoint
//!
//! Instances cannot be addressed individually, so every call goes to the
//! shared endpoint and responses identify the instance that served them.
//! A detached lock is retried until it lands on an ungrouped instance; a
//! burst of concurrent probes then samples whichever instances the balancer
//! picks while that lock runs. When the stable ids are not known up front,
//! repeated identity calls through the endpoint enumerate them first.

use crate::error::{DriverError, Result};
use crate::round::ProbeDriver;
use cohost_core::{
    exceeds, ContentionWindow, DriverConfig, Group, GroupingConfig, GroupingReport,
    InstanceControl, InstanceId, LockRequest, LockStatus, ScaledOutConfig,
};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Groups instances that share one endpoint, keyed by stable id
#[derive(Debug, Clone)]
pub struct ScaledOutGrouper {
    driver: ProbeDriver,
    config: ScaledOutConfig,
    threshold: f64,
}

impl ScaledOutGrouper {
    pub fn new(
        driver: DriverConfig,
        grouping: &GroupingConfig,
        config: ScaledOutConfig,
    ) -> cohost_core::Result<Self> {
        driver.validate()?;
        config.validate()?;
        Ok(Self::with_threshold(
            ProbeDriver::new(driver),
            config,
            grouping.require_threshold()?,
        ))
    }

    pub fn with_threshold(driver: ProbeDriver, config: ScaledOutConfig, threshold: f64) -> Self {
        Self {
            driver,
            config,
            threshold,
        }
    }

    /// Enumerate the stable ids served behind `endpoint`
    ///
    /// Waves of concurrent identity calls go out until
    /// `discovery_quiet_waves` waves in a row add no new id, or until
    /// `discovery_max_waves` waves were sent. Ids come back in discovery
    /// order.
    pub async fn discover_stable_ids(&self, endpoint: &dyn InstanceControl) -> Vec<String> {
        let timeout = self.driver.config().request_timeout();
        let mut found: Vec<String> = Vec::new();
        let mut quiet = 0;

        for wave in 1..=self.config.discovery_max_waves {
            let answers = join_all(
                (0..self.config.discovery_calls)
                    .map(|_| tokio::time::timeout(timeout, endpoint.identity())),
            )
            .await;

            let mut added = 0;
            let mut failed = 0;
            for answer in answers {
                match answer {
                    Ok(Ok(identity)) => {
                        if !found.contains(&identity.stable_id) {
                            found.push(identity.stable_id);
                            added += 1;
                        }
                    }
                    Ok(Err(e)) => {
                        debug!("Wave {}: identity call failed: {}", wave, e);
                        failed += 1;
                    }
                    Err(_) => failed += 1,
                }
            }
            debug!(
                "Discovery wave {}: {} new ids, {} failed calls",
                wave, added, failed
            );

            if added == 0 {
                quiet += 1;
                if quiet >= self.config.discovery_quiet_waves {
                    break;
                }
            } else {
                quiet = 0;
            }
        }

        info!("Discovered {} stable ids behind the endpoint", found.len());
        found
    }

    /// Partition `known` stable ids into groups through `endpoint`
    ///
    /// Ids never observed while another instance held a lock, or never
    /// reached by a lock, are returned as unresolved.
    pub async fn group(
        &self,
        endpoint: Arc<dyn InstanceControl>,
        known: Vec<String>,
    ) -> Result<GroupingReport> {
        let mut remaining: Vec<String> = Vec::with_capacity(known.len());
        for id in known {
            if remaining.contains(&id) {
                return Err(DriverError::InvalidInput(format!("Duplicate stable id {}", id)));
            }
            remaining.push(id);
        }

        info!(
            "Scaled-out grouping of {} instances, {} checks per round",
            remaining.len(),
            self.config.checks_per_round
        );

        let mut report = GroupingReport::new(self.threshold);
        let mut round: u64 = 0;
        let mut consecutive_aborts = 0;

        while !remaining.is_empty() {
            let Some((lock_id, sent, request)) =
                self.acquire_lock(endpoint.as_ref(), &remaining, &mut round).await
            else {
                warn!(
                    "No lock landed on an ungrouped instance after {} attempts",
                    self.config.max_lock_attempts
                );
                break;
            };
            report.rounds += 1;

            let window = ContentionWindow::new(
                sent + self.driver.config().warmup(),
                sent + request.duration(),
            );
            tokio::time::sleep_until(tokio::time::Instant::from_std(window.start)).await;

            let observations = join_all((0..self.config.checks_per_round).map(|check| {
                self.driver
                    .probe_control(InstanceId::new(format!("check-{}", check)), endpoint.as_ref())
            }))
            .await;

            let failed = observations.iter().filter(|o| o.call_failed).count();
            if self.driver.should_abort(failed, observations.len()) {
                report.aborted_rounds += 1;
                consecutive_aborts += 1;
                warn!(
                    "Round {}: {} of {} checks failed, discarding round",
                    round,
                    failed,
                    observations.len()
                );
                self.driver.settle_until(window.end).await;
                if consecutive_aborts > self.driver.config().max_round_retries {
                    break;
                }
                continue;
            }
            consecutive_aborts = 0;

            let mut best: HashMap<&str, f64> = HashMap::new();
            for observation in &observations {
                let Some(served_by) = observation.served_by.as_deref() else {
                    continue;
                };
                if served_by == lock_id || !remaining.iter().any(|id| id == served_by) {
                    continue;
                }
                if !window.contains(observation.started, observation.finished)
                    || !observation.result.is_confident()
                {
                    continue;
                }
                let metric = observation.result.metric;
                best.entry(served_by)
                    .and_modify(|m| *m = m.max(metric))
                    .or_insert(metric);
            }

            debug!(
                "Round {}: observed {} of {} remaining instances under {}",
                round,
                best.len(),
                remaining.len() - 1,
                lock_id
            );

            let members: HashSet<String> = best
                .into_iter()
                .filter(|(_, metric)| exceeds(*metric, self.threshold))
                .map(|(id, _)| id.to_string())
                .collect();

            let mut group = Group::singleton(InstanceId::new(lock_id.clone()));
            group.members.extend(
                remaining
                    .iter()
                    .filter(|id| members.contains(*id))
                    .map(|id| InstanceId::new(id.clone())),
            );
            info!("Group under {}: {} instances", lock_id, group.members.len());

            remaining.retain(|id| *id != lock_id && !members.contains(id));
            report.groups.push(group);

            self.driver.settle_until(window.end).await;
        }

        report.unresolved = remaining.into_iter().map(InstanceId::new).collect();
        info!(
            "Scaled-out grouping finished: {} groups, {} unresolved",
            report.groups.len(),
            report.unresolved.len()
        );
        Ok(report)
    }

    /// Issue detached locks until one is taken by an instance in `remaining`
    async fn acquire_lock(
        &self,
        endpoint: &dyn InstanceControl,
        remaining: &[String],
        round: &mut u64,
    ) -> Option<(String, Instant, LockRequest)> {
        for attempt in 1..=self.config.max_lock_attempts {
            let request = self.driver.config().lock_request(*round).detached();
            *round += 1;

            let sent = Instant::now();
            let outcome =
                tokio::time::timeout(self.driver.config().request_timeout(), endpoint.lock(&request))
                    .await;

            match outcome {
                Ok(Ok(ack)) => match (ack.status, ack.stable_id) {
                    (LockStatus::Started, Some(id)) if remaining.contains(&id) => {
                        debug!("Attempt {}: lock taken by {}", attempt, id);
                        return Some((id, sent, request));
                    }
                    (LockStatus::Started, id) => {
                        debug!(
                            "Attempt {}: lock taken by {:?}, already grouped or unknown",
                            attempt, id
                        );
                        self.driver.settle_until(sent + request.duration()).await;
                    }
                    (status, id) => {
                        debug!("Attempt {}: {:?} from {:?}", attempt, status, id);
                        tokio::time::sleep(self.driver.config().settle()).await;
                    }
                },
                Ok(Err(e)) if !e.is_retryable() => {
                    warn!("Attempt {}: lock rejected, giving up: {}", attempt, e);
                    return None;
                }
                Ok(Err(e)) => {
                    warn!("Attempt {}: lock failed: {}", attempt, e);
                    tokio::time::sleep(self.driver.config().settle()).await;
                }
                Err(_) => {
                    warn!("Attempt {}: lock timed out", attempt);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fast_driver;
    use cohost_dev::{Fault, SimulatedCluster, SimulatedLoadBalancer};
    use std::collections::BTreeSet;

    fn grouper(max_lock_attempts: u32) -> ScaledOutGrouper {
        ScaledOutGrouper::with_threshold(
            fast_driver(),
            ScaledOutConfig {
                checks_per_round: 60,
                max_lock_attempts,
                ..ScaledOutConfig::default()
            },
            350.0,
        )
    }

    #[tokio::test]
    async fn test_groups_behind_load_balancer() {
        let cluster = SimulatedCluster::builder()
            .uniform_hosts(2, 2)
            .build()
            .unwrap();
        let endpoint: Arc<dyn InstanceControl> = Arc::new(SimulatedLoadBalancer::new(&cluster));

        let report = grouper(100)
            .group(endpoint, cluster.stable_ids())
            .await
            .unwrap();

        let found: BTreeSet<BTreeSet<String>> = report
            .groups
            .iter()
            .map(|g| g.members.iter().map(|id| id.to_string()).collect())
            .collect();
        let truth: BTreeSet<BTreeSet<String>> = cluster
            .ground_truth_stable()
            .into_iter()
            .map(|host| host.into_iter().collect())
            .collect();

        assert_eq!(found, truth);
        assert!(report.unresolved.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_stay_unresolved() {
        let cluster = SimulatedCluster::builder().host(["a"]).build().unwrap();
        let endpoint: Arc<dyn InstanceControl> = Arc::new(SimulatedLoadBalancer::new(&cluster));

        let report = grouper(3)
            .group(endpoint, vec!["stable-a".to_string(), "ghost".to_string()])
            .await
            .unwrap();

        assert_eq!(report.groups, vec![Group::singleton("stable-a".into())]);
        assert_eq!(report.unresolved, vec![InstanceId::from("ghost")]);
    }

    #[tokio::test]
    async fn test_discovers_every_instance() {
        let cluster = SimulatedCluster::builder()
            .uniform_hosts(2, 2)
            .build()
            .unwrap();
        let balancer = SimulatedLoadBalancer::new(&cluster);

        let found: BTreeSet<String> = grouper(1)
            .discover_stable_ids(&balancer)
            .await
            .into_iter()
            .collect();

        assert_eq!(found, cluster.stable_ids().into_iter().collect::<BTreeSet<_>>());
    }

    #[tokio::test]
    async fn test_discovery_stops_when_quiet() {
        let cluster = SimulatedCluster::builder().host(["a"]).build().unwrap();
        let balancer = SimulatedLoadBalancer::new(&cluster);

        let found = grouper(1).discover_stable_ids(&balancer).await;

        assert_eq!(found, vec!["stable-a".to_string()]);

        cluster.inject_fault(&"a".into(), Fault::Unreachable);
        assert!(grouper(1).discover_stable_ids(&balancer).await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_lock_is_not_retried() {
        let cluster = SimulatedCluster::builder().host(["a"]).build().unwrap();
        cluster.inject_fault(&"a".into(), Fault::NotAnAgent);
        let endpoint: Arc<dyn InstanceControl> = Arc::new(SimulatedLoadBalancer::new(&cluster));

        let report = grouper(5)
            .group(endpoint, vec!["stable-a".to_string()])
            .await
            .unwrap();

        assert_eq!(report.unresolved, vec![InstanceId::from("stable-a")]);
        assert_eq!(cluster.lock_calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let cluster = SimulatedCluster::builder().host(["a"]).build().unwrap();
        let endpoint: Arc<dyn InstanceControl> = Arc::new(SimulatedLoadBalancer::new(&cluster));

        let result = grouper(3)
            .group(endpoint, vec!["stable-a".to_string(), "stable-a".to_string()])
            .await;
        assert!(matches!(result, Err(DriverError::InvalidInput(_))));
    }
}
