//! Simulated load-balanced endpoint in front of a cluster
//!
//! Every call is routed to a uniformly random instance; responses carry the
//! serving instance's stable id, as a scaled-out deployment would.

use crate::cluster::{SimulatedCluster, SimulatedInstance};
use async_trait::async_trait;
use cohost_core::{Identity, InstanceControl, LockAck, LockRequest, ProbeReport};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct SimulatedLoadBalancer {
    cluster: SimulatedCluster,
}

impl SimulatedLoadBalancer {
    pub fn new(cluster: &SimulatedCluster) -> Self {
        Self {
            cluster: cluster.clone(),
        }
    }

    fn route(&self) -> cohost_core::Result<SimulatedInstance> {
        let count = self.cluster.instance_count();
        if count == 0 {
            return Err(cohost_core::Error::unavailable("no instances behind load balancer"));
        }
        let index = (self.cluster.next_u64() % count as u64) as usize;
        let instance = self.cluster.instance_at(index);
        trace!("Routing to {}", instance.id());
        Ok(instance)
    }
}

#[async_trait]
impl InstanceControl for SimulatedLoadBalancer {
    async fn lock(&self, request: &LockRequest) -> cohost_core::Result<LockAck> {
        self.route()?.lock(request).await
    }

    async fn probe(&self, repetitions: usize) -> cohost_core::Result<ProbeReport> {
        self.route()?.probe(repetitions).await
    }

    async fn identity(&self) -> cohost_core::Result<Identity> {
        self.route()?.identity().await
    }

    async fn stop(&self) -> cohost_core::Result<LockAck> {
        self.route()?.stop().await
    }
}
