//! Shared fixtures for the driver tests

use crate::round::{InstanceHandle, ProbeDriver};
use cohost_core::{DriverConfig, LocalizationConfig};
use cohost_dev::SimulatedCluster;

/// Driver timed for the simulated cluster
pub fn fast_config() -> DriverConfig {
    DriverConfig {
        request_timeout_ms: 1_000,
        lock_duration_ms: 40,
        warmup_ms: 5,
        settle_ms: 10,
        min_samples: 50,
        probe_repetitions: 100,
        ..DriverConfig::default()
    }
}

pub fn fast_driver() -> ProbeDriver {
    ProbeDriver::new(fast_config())
}

pub fn fast_localization() -> LocalizationConfig {
    LocalizationConfig {
        threshold_ms: Some(35.0),
        victim_runs: 5,
        min_victim_samples: 3,
        victim_timeout_ms: 1_000,
        ..LocalizationConfig::default()
    }
}

pub fn handles(cluster: &SimulatedCluster) -> Vec<InstanceHandle> {
    cluster
        .handles()
        .into_iter()
        .map(InstanceHandle::from)
        .collect()
}
