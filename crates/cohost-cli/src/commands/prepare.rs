//! Candidate set preparation

use cohost_core::{CandidateSets, CohostConfig, GroupingReport, InstanceDescriptor};
use cohost_driver::{prepare_candidate_sets, InstanceHandle, ProbeDriver};

/// Bucket instances by hardware signature, one per known host
///
/// Groups from an earlier grouping run collapse each host to a single
/// representative.
pub async fn prepare_sets(
    config: &CohostConfig,
    instances: Vec<(InstanceDescriptor, InstanceHandle)>,
    grouping: Option<&GroupingReport>,
) -> CandidateSets {
    let driver = ProbeDriver::new(config.driver.clone());
    let groups = grouping.map(|report| report.groups.as_slice()).unwrap_or_default();

    prepare_candidate_sets(&driver, &instances, groups).await
}
