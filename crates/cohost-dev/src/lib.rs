//! # cohost-dev
//!
//! Development and testing utilities for cohost.
//!
//! This crate provides:
//! - A simulated cluster implementing `InstanceControl` over a known host map
//! - A simulated victim whose latency rises while its host is locked
//! - A simulated load balancer for scaled-out grouping
//! - Test logging setup

pub mod cluster;
pub mod load_balancer;
pub mod utils;
pub mod victim;

// Re-export commonly used types
pub use cluster::{Fault, SimulatedCluster, SimulatedClusterBuilder, SimulatedInstance, SimulationConfig};
pub use load_balancer::SimulatedLoadBalancer;
pub use utils::setup_test_logging;
pub use victim::{SimulatedVictim, VictimConfig};

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum DevError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Core error: {0}")]
    Core(#[from] cohost_core::Error),
}

pub type Result<T> = std::result::Result<T, DevError>;

/// Two hosts, `{a, b}` and `{c, d}`
pub fn two_by_two_cluster() -> Result<SimulatedCluster> {
    SimulatedCluster::builder()
        .host(["a", "b"])
        .host(["c", "d"])
        .build()
}

/// `count` single-instance hosts named `cand-0` .. `cand-{count-1}`
pub fn singleton_hosts(count: usize) -> Result<SimulatedCluster> {
    (0..count)
        .fold(SimulatedCluster::builder(), |builder, i| {
            builder.host([format!("cand-{}", i)])
        })
        .build()
}
