//! Grouping commands

use anyhow::{bail, Context, Result};
use cohost_core::{CohostConfig, GroupingReport, InstanceControl};
use cohost_driver::{CoResidencyGrouper, InstanceHandle, ScaledOutGrouper};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Group addressable instances by host
pub async fn group_instances(
    config: &CohostConfig,
    instances: Vec<InstanceHandle>,
) -> Result<GroupingReport> {
    let grouper = CoResidencyGrouper::new(config.driver.clone(), &config.grouping)
        .context("Invalid grouping configuration")?;
    let report = grouper.group(instances).await?;

    info!(
        "Formed {} groups over {} instances in {} rounds",
        report.groups.len(),
        report.grouped_count(),
        report.rounds
    );
    if !report.unreachable.is_empty() {
        warn!("{} instances unreachable", report.unreachable.len());
    }
    Ok(report)
}

/// Group instances behind one load-balanced endpoint by stable id
///
/// With no known ids the endpoint is sampled for them first.
pub async fn group_scaled(
    config: &CohostConfig,
    endpoint: Arc<dyn InstanceControl>,
    known: Vec<String>,
) -> Result<GroupingReport> {
    let grouper = ScaledOutGrouper::new(
        config.driver.clone(),
        &config.grouping,
        config.scaled_out.clone(),
    )
    .context("Invalid scaled-out configuration")?;

    let known = if known.is_empty() {
        let found = grouper.discover_stable_ids(endpoint.as_ref()).await;
        if found.is_empty() {
            bail!("No stable ids given and none answered on the endpoint");
        }
        info!("Discovered {} stable ids behind the endpoint", found.len());
        found
    } else {
        known
    };
    let report = grouper.group(endpoint, known).await?;

    info!(
        "Formed {} groups, {} instances unresolved",
        report.groups.len(),
        report.unresolved.len()
    );
    Ok(report)
}

/// Stable ids from `--ids` followed by the lines of `--ids-file`
///
/// Repeated ids are kept once, in first-seen order.
pub fn known_ids(inline: &[String], file: Option<&Path>) -> Result<Vec<String>> {
    let mut ids: Vec<String> = inline.iter().map(|id| id.trim().to_string()).collect();

    if let Some(path) = file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read stable ids from {}", path.display()))?;
        ids.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }

    let mut unique: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !id.is_empty() && !unique.contains(&id) {
            unique.push(id);
        }
    }
    Ok(unique)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::fast_config;
    use cohost_core::GroupingConfig;
    use cohost_dev::{two_by_two_cluster, Fault, SimulatedCluster, SimulatedLoadBalancer};
    use std::io::Write;

    fn handles(cluster: &SimulatedCluster) -> Vec<InstanceHandle> {
        cluster.handles().into_iter().map(InstanceHandle::from).collect()
    }

    #[tokio::test]
    async fn test_group_instances() {
        let cluster = two_by_two_cluster().unwrap();

        let report = group_instances(&fast_config(), handles(&cluster)).await.unwrap();

        assert_eq!(report.groups.len(), 2);
        assert!(report.is_partition_of(&cluster.instance_ids()));
        assert_eq!(report.threshold, 350.0);
    }

    #[tokio::test]
    async fn test_group_requires_threshold() {
        let cluster = two_by_two_cluster().unwrap();
        let config = CohostConfig {
            grouping: GroupingConfig::default(),
            ..fast_config()
        };

        assert!(group_instances(&config, handles(&cluster)).await.is_err());
    }

    #[tokio::test]
    async fn test_group_scaled() {
        let cluster = two_by_two_cluster().unwrap();
        let endpoint: Arc<dyn InstanceControl> = Arc::new(SimulatedLoadBalancer::new(&cluster));

        let report = group_scaled(&fast_config(), endpoint, cluster.stable_ids())
            .await
            .unwrap();

        assert_eq!(report.groups.len(), 2);
        assert_eq!(report.grouped_count(), 4);
    }

    #[tokio::test]
    async fn test_group_scaled_discovers_ids() {
        let cluster = two_by_two_cluster().unwrap();
        let endpoint: Arc<dyn InstanceControl> = Arc::new(SimulatedLoadBalancer::new(&cluster));

        let report = group_scaled(&fast_config(), endpoint, Vec::new())
            .await
            .unwrap();

        assert_eq!(report.groups.len(), 2);
        assert_eq!(report.grouped_count(), 4);
    }

    #[tokio::test]
    async fn test_group_scaled_nothing_discovered() {
        let cluster = two_by_two_cluster().unwrap();
        for id in cluster.instance_ids() {
            cluster.inject_fault(&id, Fault::NotAnAgent);
        }
        let endpoint: Arc<dyn InstanceControl> = Arc::new(SimulatedLoadBalancer::new(&cluster));

        let err = group_scaled(&fast_config(), endpoint, Vec::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No stable ids"));
    }

    #[test]
    fn test_known_ids() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# stable ids\ni-2\n\ni-3\ni-1").unwrap();

        let ids = known_ids(&["i-1".to_string(), " i-2 ".to_string()], Some(file.path())).unwrap();
        assert_eq!(ids, vec!["i-1", "i-2", "i-3"]);

        assert!(known_ids(&[], None).unwrap().is_empty());
        assert!(known_ids(&[], Some(Path::new("/nonexistent/ids"))).is_err());
    }
}
