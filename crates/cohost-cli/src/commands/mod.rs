//! Subcommand implementations

pub mod baseline;
pub mod contend;
pub mod group;
pub mod localize;
pub mod prepare;

use anyhow::{Context, Result};
use cohost_core::{load_descriptors, DriverConfig, InstanceDescriptor};
use cohost_driver::{connect_instances, InstanceHandle};
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::debug;

/// Load an instance list and build one agent handle per entry
pub fn connect(
    driver: &DriverConfig,
    path: &Path,
) -> Result<(Vec<InstanceDescriptor>, Vec<InstanceHandle>)> {
    let descriptors = load_descriptors(path)
        .with_context(|| format!("Failed to load instances from {}", path.display()))?;
    debug!("Loaded {} instances from {}", descriptors.len(), path.display());

    let handles = connect_instances(&descriptors, driver.request_timeout())?;
    Ok((descriptors, handles))
}

/// Read a JSON report written by an earlier run
pub fn read_report<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse report {}", path.display()))
}

#[cfg(test)]
pub(crate) mod testing {
    use cohost_core::{CohostConfig, DriverConfig, GroupingConfig, LocalizationConfig};

    /// Configuration timed for the simulated cluster
    pub fn fast_config() -> CohostConfig {
        CohostConfig {
            driver: DriverConfig {
                request_timeout_ms: 1_000,
                lock_duration_ms: 40,
                warmup_ms: 5,
                settle_ms: 10,
                min_samples: 50,
                probe_repetitions: 100,
                ..DriverConfig::default()
            },
            grouping: GroupingConfig {
                threshold: Some(350.0),
                ..GroupingConfig::default()
            },
            localization: LocalizationConfig {
                threshold_ms: Some(35.0),
                victim_runs: 5,
                min_victim_samples: 3,
                victim_timeout_ms: 1_000,
                ..LocalizationConfig::default()
            },
            ..CohostConfig::default()
        }
    }
}
