//! Simulated cluster of instances with a ground-truth host assignment
//!
//! Probe batches follow `baseline + boost·[host under active lock] + noise`,
//! so tests can check that the driver recovers the configured partition.

use crate::{DevError, Result};
use async_trait::async_trait;
use cohost_core::{
    HardwareSignature, Identity, InstanceControl, InstanceId, LockAck, LockRequest, LockStatus,
    ProbeReport,
};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// Parameters of the synthetic timing model
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Reload latency without contention
    pub baseline: f64,

    /// Extra latency while a co-resident instance holds a lock
    pub boost: f64,

    /// Standard deviation of per-sample noise
    pub noise_std_dev: f64,

    /// Wall-clock time one probe call takes
    pub probe_latency: Duration,

    /// Seed of the noise generator
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            baseline: 200.0,
            boost: 300.0,
            noise_std_dev: 10.0,
            probe_latency: Duration::from_millis(2),
            seed: 7,
        }
    }
}

/// Misbehaviour injected into one simulated instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every call fails with a network error
    Unreachable,
    /// Every call is answered with a not-found error, as by a foreign server
    NotAnAgent,
    /// The next `n` calls of any kind time out
    FailCalls(u32),
    /// The next `n` lock calls fail to set up contention
    FailLocks(u32),
    /// After `after` lock calls succeed, the next `count` lock calls time out
    LockOutage { after: u32, count: u32 },
    /// Probes return only this many samples
    ShortBatch(usize),
    /// Locks succeed but apply no contention
    NoContention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Lock,
    Probe,
    Identity,
    Stop,
}

#[derive(Debug)]
struct SimulatedInstanceInfo {
    id: InstanceId,
    host: usize,
    stable_id: String,
    signature: HardwareSignature,
}

#[derive(Debug)]
struct ClusterState {
    /// Active lock count per host
    active_hosts: HashMap<usize, usize>,
    /// Instances running a detached lock, with the signal that ends it
    detached: HashMap<usize, Arc<Notify>>,
    faults: HashMap<usize, Fault>,
    rng: SmallRng,
    lock_calls: usize,
    probe_calls: usize,
}

#[derive(Debug)]
struct ClusterInner {
    config: SimulationConfig,
    noise: Normal<f64>,
    instances: Vec<SimulatedInstanceInfo>,
    index: HashMap<InstanceId, usize>,
    host_count: usize,
    state: Mutex<ClusterState>,
}

impl ClusterInner {
    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a host marked as contended until dropped
struct ActiveGuard {
    inner: Arc<ClusterInner>,
    host: usize,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        if let Some(count) = state.active_hosts.get_mut(&self.host) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.active_hosts.remove(&self.host);
            }
        }
    }
}

/// Shared handle to a simulated cluster
#[derive(Debug, Clone)]
pub struct SimulatedCluster {
    inner: Arc<ClusterInner>,
}

impl SimulatedCluster {
    pub fn builder() -> SimulatedClusterBuilder {
        SimulatedClusterBuilder::new()
    }

    /// Instance ids in declaration order
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.inner.instances.iter().map(|i| i.id.clone()).collect()
    }

    /// Stable ids in declaration order
    pub fn stable_ids(&self) -> Vec<String> {
        self.inner.instances.iter().map(|i| i.stable_id.clone()).collect()
    }

    pub fn stable_id(&self, id: &InstanceId) -> Option<&str> {
        let idx = *self.inner.index.get(id)?;
        Some(self.inner.instances[idx].stable_id.as_str())
    }

    pub fn host_of(&self, id: &InstanceId) -> Option<usize> {
        let idx = *self.inner.index.get(id)?;
        Some(self.inner.instances[idx].host)
    }

    pub fn host_count(&self) -> usize {
        self.inner.host_count
    }

    /// Control handle for one instance
    pub fn instance(&self, id: &InstanceId) -> Option<SimulatedInstance> {
        let index = *self.inner.index.get(id)?;
        Some(SimulatedInstance {
            cluster: self.clone(),
            index,
        })
    }

    /// Control handles for every instance, in declaration order
    pub fn handles(&self) -> Vec<(InstanceId, Arc<dyn InstanceControl>)> {
        (0..self.inner.instances.len())
            .map(|index| {
                let handle: Arc<dyn InstanceControl> = Arc::new(SimulatedInstance {
                    cluster: self.clone(),
                    index,
                });
                (self.inner.instances[index].id.clone(), handle)
            })
            .collect()
    }

    /// Hosts as instance-id lists, hosts without instances omitted
    pub fn ground_truth(&self) -> Vec<Vec<InstanceId>> {
        let mut hosts: Vec<Vec<InstanceId>> = vec![Vec::new(); self.inner.host_count];
        for info in &self.inner.instances {
            hosts[info.host].push(info.id.clone());
        }
        hosts.retain(|members| !members.is_empty());
        hosts
    }

    /// Ground truth keyed by stable id
    pub fn ground_truth_stable(&self) -> Vec<Vec<String>> {
        self.ground_truth()
            .into_iter()
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| self.stable_id(id).map(str::to_string))
                    .collect()
            })
            .collect()
    }

    pub fn is_host_active(&self, host: usize) -> bool {
        self.inner.state().active_hosts.contains_key(&host)
    }

    pub fn inject_fault(&self, id: &InstanceId, fault: Fault) {
        if let Some(&index) = self.inner.index.get(id) {
            self.inner.state().faults.insert(index, fault);
        }
    }

    pub fn clear_fault(&self, id: &InstanceId) {
        if let Some(&index) = self.inner.index.get(id) {
            self.inner.state().faults.remove(&index);
        }
    }

    /// Lock calls received so far, across all instances
    pub fn lock_calls(&self) -> usize {
        self.inner.state().lock_calls
    }

    /// Probe calls received so far, across all instances
    pub fn probe_calls(&self) -> usize {
        self.inner.state().probe_calls
    }

    pub(crate) fn next_u64(&self) -> u64 {
        use rand::RngCore;
        self.inner.state().rng.next_u64()
    }

    pub(crate) fn instance_count(&self) -> usize {
        self.inner.instances.len()
    }

    pub(crate) fn instance_at(&self, index: usize) -> SimulatedInstance {
        SimulatedInstance {
            cluster: self.clone(),
            index,
        }
    }

    fn check_fault(&self, index: usize, operation: Operation) -> cohost_core::Result<()> {
        let mut state = self.inner.state();
        match operation {
            Operation::Lock => state.lock_calls += 1,
            Operation::Probe => state.probe_calls += 1,
            Operation::Identity | Operation::Stop => {}
        }

        let id = &self.inner.instances[index].id;
        match state.faults.get(&index).copied() {
            Some(Fault::Unreachable) => {
                Err(cohost_core::Error::network(format!("{} is unreachable", id)))
            }
            Some(Fault::NotAnAgent) => Err(cohost_core::Error::not_found(format!(
                "{} serves no agent routes",
                id
            ))),
            Some(Fault::FailCalls(remaining)) if remaining > 0 => {
                if remaining == 1 {
                    state.faults.remove(&index);
                } else {
                    state.faults.insert(index, Fault::FailCalls(remaining - 1));
                }
                Err(cohost_core::Error::timeout(format!("{} did not answer", id)))
            }
            Some(Fault::FailLocks(remaining)) if remaining > 0 && operation == Operation::Lock => {
                if remaining == 1 {
                    state.faults.remove(&index);
                } else {
                    state.faults.insert(index, Fault::FailLocks(remaining - 1));
                }
                Err(cohost_core::Error::contention_setup(format!(
                    "{} failed to allocate contention region",
                    id
                )))
            }
            Some(Fault::LockOutage { after, count }) if count > 0 && operation == Operation::Lock => {
                if after > 0 {
                    state.faults.insert(index, Fault::LockOutage { after: after - 1, count });
                    return Ok(());
                }
                if count == 1 {
                    state.faults.remove(&index);
                } else {
                    state
                        .faults
                        .insert(index, Fault::LockOutage { after: 0, count: count - 1 });
                }
                Err(cohost_core::Error::timeout(format!("{} did not answer the lock", id)))
            }
            _ => Ok(()),
        }
    }

    fn fault(&self, index: usize) -> Option<Fault> {
        self.inner.state().faults.get(&index).copied()
    }

    fn activate(&self, host: usize) -> ActiveGuard {
        *self.inner.state().active_hosts.entry(host).or_insert(0) += 1;
        ActiveGuard {
            inner: Arc::clone(&self.inner),
            host,
        }
    }

    fn sample_batch(&self, index: usize, count: usize) -> Vec<u64> {
        let host = self.inner.instances[index].host;
        let config = &self.inner.config;
        let mut state = self.inner.state();

        let contended = state.active_hosts.contains_key(&host);
        let mean = config.baseline + if contended { config.boost } else { 0.0 };

        (0..count)
            .map(|_| {
                let value = mean + self.inner.noise.sample(&mut state.rng);
                value.max(0.0).round() as u64
            })
            .collect()
    }
}

/// One instance of a simulated cluster
#[derive(Debug, Clone)]
pub struct SimulatedInstance {
    cluster: SimulatedCluster,
    index: usize,
}

impl SimulatedInstance {
    fn info(&self) -> &SimulatedInstanceInfo {
        &self.cluster.inner.instances[self.index]
    }

    pub fn id(&self) -> &InstanceId {
        &self.info().id
    }

    pub fn stable_id(&self) -> &str {
        &self.info().stable_id
    }
}

#[async_trait]
impl InstanceControl for SimulatedInstance {
    async fn lock(&self, request: &LockRequest) -> cohost_core::Result<LockAck> {
        self.cluster.check_fault(self.index, Operation::Lock)?;

        let host = self.info().host;
        let stable_id = Some(self.info().stable_id.clone());
        let applies_contention = self.cluster.fault(self.index) != Some(Fault::NoContention);
        let duration = request.duration();

        if request.detach {
            let notify = Arc::new(Notify::new());
            {
                let mut state = self.cluster.inner.state();
                if state.detached.contains_key(&self.index) {
                    return Ok(LockAck {
                        status: LockStatus::AlreadyActive,
                        stable_id,
                        elapsed_ms: 0,
                    });
                }
                state.detached.insert(self.index, Arc::clone(&notify));
            }

            let guard = applies_contention.then(|| self.cluster.activate(host));
            let cluster = self.cluster.clone();
            let index = self.index;
            let until_stopped = request.until_stopped;
            tokio::spawn(async move {
                if until_stopped {
                    notify.notified().await;
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = notify.notified() => {}
                    }
                }
                {
                    let mut state = cluster.inner.state();
                    if state.detached.get(&index).is_some_and(|n| Arc::ptr_eq(n, &notify)) {
                        state.detached.remove(&index);
                    }
                }
                drop(guard);
            });

            debug!("Simulated detached lock on {} for {:?}", self.id(), duration);
            return Ok(LockAck {
                status: LockStatus::Started,
                stable_id,
                elapsed_ms: 0,
            });
        }

        let started = Instant::now();
        let _guard = applies_contention.then(|| self.cluster.activate(host));
        tokio::time::sleep(duration).await;

        Ok(LockAck {
            status: LockStatus::Completed,
            stable_id,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn probe(&self, repetitions: usize) -> cohost_core::Result<ProbeReport> {
        self.cluster.check_fault(self.index, Operation::Probe)?;

        let count = match self.cluster.fault(self.index) {
            Some(Fault::ShortBatch(n)) => n.min(repetitions),
            _ => repetitions,
        };

        let samples = self.cluster.sample_batch(self.index, count);
        tokio::time::sleep(self.cluster.inner.config.probe_latency).await;

        let metric = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<u64>() as f64 / samples.len() as f64
        };

        Ok(ProbeReport {
            metric,
            samples,
            hardware_signature: self.info().signature.clone(),
            stable_id: Some(self.info().stable_id.clone()),
        })
    }

    async fn identity(&self) -> cohost_core::Result<Identity> {
        self.cluster.check_fault(self.index, Operation::Identity)?;
        Ok(Identity {
            stable_id: self.info().stable_id.clone(),
        })
    }

    async fn stop(&self) -> cohost_core::Result<LockAck> {
        self.cluster.check_fault(self.index, Operation::Stop)?;

        let running = self.cluster.inner.state().detached.remove(&self.index);
        let status = match running {
            Some(notify) => {
                notify.notify_one();
                LockStatus::Stopped
            }
            None => LockStatus::NotActive,
        };
        Ok(LockAck {
            status,
            stable_id: Some(self.info().stable_id.clone()),
            elapsed_ms: 0,
        })
    }
}

/// Builder for [`SimulatedCluster`]
#[derive(Debug, Default)]
pub struct SimulatedClusterBuilder {
    config: SimulationConfig,
    hosts: Vec<Vec<String>>,
    signatures: HashMap<String, HardwareSignature>,
}

impl SimulatedClusterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SimulationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Add one physical host carrying the given instances
    pub fn host<I, S>(mut self, instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts.push(instances.into_iter().map(Into::into).collect());
        self
    }

    /// Add `count` hosts with `per_host` instances each, named `h<host>-i<n>`
    pub fn uniform_hosts(mut self, count: usize, per_host: usize) -> Self {
        for host in 0..count {
            self.hosts
                .push((0..per_host).map(|n| format!("h{}-i{}", host, n)).collect());
        }
        self
    }

    /// Override the hardware signature of one instance
    pub fn signature(mut self, instance: impl Into<String>, signature: HardwareSignature) -> Self {
        self.signatures.insert(instance.into(), signature);
        self
    }

    pub fn build(self) -> Result<SimulatedCluster> {
        let noise = Normal::new(0.0, self.config.noise_std_dev)
            .map_err(|e| DevError::Config(format!("invalid noise: {}", e)))?;

        let default_signature = HardwareSignature::from_brand("Simulated Xeon CPU @ 2.60GHz");
        let mut instances = Vec::new();
        let mut index = HashMap::new();

        for (host, members) in self.hosts.iter().enumerate() {
            for name in members {
                let id = InstanceId::new(name.clone());
                if index.insert(id.clone(), instances.len()).is_some() {
                    return Err(DevError::Config(format!("duplicate instance {}", name)));
                }
                instances.push(SimulatedInstanceInfo {
                    id,
                    host,
                    stable_id: format!("stable-{}", name),
                    signature: self
                        .signatures
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| default_signature.clone()),
                });
            }
        }

        let state = ClusterState {
            active_hosts: HashMap::new(),
            detached: HashMap::new(),
            faults: HashMap::new(),
            rng: SmallRng::seed_from_u64(self.config.seed),
            lock_calls: 0,
            probe_calls: 0,
        };

        Ok(SimulatedCluster {
            inner: Arc::new(ClusterInner {
                config: self.config,
                noise,
                instances,
                index,
                host_count: self.hosts.len(),
                state: Mutex::new(state),
            }),
        })
    }
}
