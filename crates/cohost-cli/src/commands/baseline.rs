//! Baseline measurement command

use anyhow::{bail, Result};
use cohost_core::{BaselineReport, CohostConfig};
use cohost_driver::{measure_baseline, InstanceHandle, ProbeDriver};
use tracing::info;

/// Probe every instance `batches` times without any lock
pub async fn baseline(
    config: &CohostConfig,
    instances: &[InstanceHandle],
    batches: usize,
) -> Result<BaselineReport> {
    if batches == 0 {
        bail!("--batches must be at least 1");
    }

    let driver = ProbeDriver::new(config.driver.clone());
    let report = measure_baseline(&driver, instances, batches).await;

    info!(
        "Baseline over {} instances: pooled median {:.1}, p95 {:.1}",
        report.instances.len(),
        report.pooled.median,
        report.pooled.p95
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::fast_config;
    use cohost_dev::two_by_two_cluster;

    #[tokio::test]
    async fn test_baseline_stays_below_threshold() {
        let cluster = two_by_two_cluster().unwrap();
        let handles: Vec<InstanceHandle> =
            cluster.handles().into_iter().map(InstanceHandle::from).collect();
        let config = fast_config();

        let report = baseline(&config, &handles, 2).await.unwrap();

        assert_eq!(report.instances.len(), 4);
        assert!(report.instances.iter().all(|i| i.stats.count == 200));
        let threshold = config.grouping.threshold.unwrap();
        assert!(report.pooled.max < threshold);
        assert_eq!(cluster.lock_calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_batches_rejected() {
        assert!(baseline(&fast_config(), &[], 0).await.is_err());
    }
}
