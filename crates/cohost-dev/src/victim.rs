//! Simulated victim endpoint

use crate::cluster::SimulatedCluster;
use async_trait::async_trait;
use cohost_core::{InstanceId, VictimTarget};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Latency model of the victim, in milliseconds
#[derive(Debug, Clone)]
pub struct VictimConfig {
    pub base_latency_ms: f64,
    /// Added while the victim's host is under an active lock
    pub boost_ms: f64,
    /// Uniform jitter amplitude
    pub jitter_ms: f64,
    /// Wall-clock time one request takes
    pub request_time: Duration,
    pub seed: u64,
}

impl Default for VictimConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 20.0,
            boost_ms: 30.0,
            jitter_ms: 1.0,
            request_time: Duration::from_millis(1),
            seed: 11,
        }
    }
}

#[derive(Debug)]
struct VictimState {
    rng: SmallRng,
    failures_left: u32,
}

/// Victim living on the host of one cluster instance, or on a host of its own
#[derive(Debug)]
pub struct SimulatedVictim {
    cluster: SimulatedCluster,
    host: Option<usize>,
    config: VictimConfig,
    state: Mutex<VictimState>,
}

impl SimulatedVictim {
    /// Victim sharing a host with `neighbour`; `None` places it alone
    pub fn new(cluster: &SimulatedCluster, neighbour: Option<&InstanceId>, config: VictimConfig) -> Self {
        let host = neighbour.and_then(|id| cluster.host_of(id));
        let state = VictimState {
            rng: SmallRng::seed_from_u64(config.seed),
            failures_left: 0,
        };
        Self {
            cluster: cluster.clone(),
            host,
            config,
            state: Mutex::new(state),
        }
    }

    /// Victim on no attacker host
    pub fn isolated(cluster: &SimulatedCluster, config: VictimConfig) -> Self {
        Self::new(cluster, None, config)
    }

    /// Fail the next `n` requests
    pub fn fail_next(&self, n: u32) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failures_left = n;
    }
}

#[async_trait]
impl VictimTarget for SimulatedVictim {
    async fn request(&self) -> cohost_core::Result<Duration> {
        let contended = self.host.is_some_and(|host| self.cluster.is_host_active(host));

        let latency_ms = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(cohost_core::Error::network("victim connection reset"));
            }
            let jitter = if self.config.jitter_ms > 0.0 {
                state.rng.gen_range(-self.config.jitter_ms..=self.config.jitter_ms)
            } else {
                0.0
            };
            let boost = if contended { self.config.boost_ms } else { 0.0 };
            (self.config.base_latency_ms + boost + jitter).max(0.0)
        };

        tokio::time::sleep(self.config.request_time).await;
        Ok(Duration::from_secs_f64(latency_ms / 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohost_core::{InstanceControl, LockRequest};

    #[tokio::test]
    async fn test_victim_slows_under_neighbour_lock() {
        let cluster = SimulatedCluster::builder()
            .host(["a"])
            .host(["b"])
            .build()
            .unwrap();
        let victim = SimulatedVictim::new(&cluster, Some(&"b".into()), VictimConfig::default());

        let idle = victim.request().await.unwrap();
        assert!(idle < Duration::from_millis(25));

        let b = cluster.instance(&"b".into()).unwrap();
        let lock = tokio::spawn(async move {
            b.lock(&LockRequest {
                duration_ms: 40,
                ..LockRequest::default()
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let busy = victim.request().await.unwrap();
        assert!(busy > Duration::from_millis(45));
        lock.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_isolated_victim_and_failures() {
        let cluster = SimulatedCluster::builder().host(["a"]).build().unwrap();
        let victim = SimulatedVictim::isolated(&cluster, VictimConfig::default());

        victim.fail_next(2);
        assert!(victim.request().await.is_err());
        assert!(victim.request().await.is_err());
        assert!(victim.request().await.unwrap() < Duration::from_millis(25));
    }
}
