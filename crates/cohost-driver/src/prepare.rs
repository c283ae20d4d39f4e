//! Candidate set preparation
//!
//! Buckets instances by hardware signature and keeps one representative per
//! host inside every bucket, so that localization never locks two instances
//! of the same machine in one round.

use crate::round::{InstanceHandle, ProbeDriver};
use cohost_core::{CandidateSet, CandidateSets, Group, HardwareSignature, InstanceDescriptor, InstanceId};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Bucket key of instances whose signature could not be fetched
pub const UNKNOWN_BUCKET: &str = "unknown";

/// Instance together with what is known about it
#[derive(Debug, Clone)]
struct Resolved {
    id: InstanceId,
    signature: Option<HardwareSignature>,
    stable_id: Option<String>,
}

/// Build candidate sets from `instances` and prior grouping results
///
/// Signatures come from the descriptor when present and from a probe call
/// otherwise; a missing stable id alone is fetched with an identity call.
/// Instances in the same group share a host; ungrouped instances are
/// deduplicated by stable id when one is known.
pub async fn prepare_candidate_sets(
    driver: &ProbeDriver,
    instances: &[(InstanceDescriptor, InstanceHandle)],
    groups: &[Group],
) -> CandidateSets {
    let resolved = join_all(
        instances
            .iter()
            .map(|(descriptor, handle)| resolve(driver, descriptor, handle)),
    )
    .await;

    let group_of: HashMap<&InstanceId, usize> = groups
        .iter()
        .enumerate()
        .flat_map(|(index, group)| group.members.iter().map(move |id| (id, index)))
        .collect();

    let mut buckets: BTreeMap<String, (HardwareSignature, Vec<InstanceId>, HashSet<String>)> =
        BTreeMap::new();

    for instance in resolved {
        let (key, signature) = match &instance.signature {
            Some(signature) => (signature.key(), signature.clone()),
            None => (
                UNKNOWN_BUCKET.to_string(),
                HardwareSignature::from_brand(UNKNOWN_BUCKET),
            ),
        };

        let host = match (group_of.get(&instance.id), &instance.stable_id) {
            (Some(index), _) => format!("group:{}", index),
            (None, Some(stable_id)) => format!("stable:{}", stable_id),
            (None, None) => format!("instance:{}", instance.id),
        };

        let (_, members, hosts) = buckets
            .entry(key)
            .or_insert_with(|| (signature, Vec::new(), HashSet::new()));
        if hosts.insert(host.clone()) {
            members.push(instance.id);
        } else {
            debug!("Skipping {}, {} already represented", instance.id, host);
        }
    }

    let sets: Vec<CandidateSet> = buckets
        .into_values()
        .map(|(signature, mut instances, _)| {
            instances.sort();
            CandidateSet {
                signature,
                instances,
            }
        })
        .collect();

    let prepared = CandidateSets { sets };
    info!(
        "Prepared {} candidate sets with {} candidates",
        prepared.sets.len(),
        prepared.total_candidates()
    );
    prepared
}

async fn resolve(
    driver: &ProbeDriver,
    descriptor: &InstanceDescriptor,
    handle: &InstanceHandle,
) -> Resolved {
    let mut resolved = Resolved {
        id: handle.id.clone(),
        signature: descriptor.signature.clone(),
        stable_id: descriptor.stable_id.clone(),
    };

    if resolved.signature.is_none() {
        let observation = driver.probe(handle).await;
        if observation.call_failed {
            warn!("Could not fetch signature of {}", handle.id);
        }
        resolved.signature = observation.signature;
        resolved.stable_id = resolved.stable_id.or(observation.served_by);
    } else if resolved.stable_id.is_none() {
        let timeout = driver.config().request_timeout();
        match tokio::time::timeout(timeout, handle.control.identity()).await {
            Ok(Ok(identity)) => resolved.stable_id = Some(identity.stable_id),
            Ok(Err(e)) => warn!("Could not fetch stable id of {}: {}", handle.id, e),
            Err(_) => warn!("Stable id lookup of {} timed out", handle.id),
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_driver, handles};
    use cohost_dev::{Fault, SimulatedCluster};
    use std::sync::Arc;

    fn pairs(cluster: &SimulatedCluster) -> Vec<(InstanceDescriptor, InstanceHandle)> {
        handles(cluster)
            .into_iter()
            .map(|handle| {
                let url = format!("http://{}.example/", handle.id);
                (InstanceDescriptor::parse(&url).unwrap(), handle)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_buckets_by_signature_and_host() {
        let fast = HardwareSignature::from_brand("Fast CPU @ 3.00GHz");
        let cluster = SimulatedCluster::builder()
            .host(["a", "b"])
            .host(["c"])
            .host(["d"])
            .signature("d", fast.clone())
            .build()
            .unwrap();

        let sets = prepare_candidate_sets(&fast_driver(), &pairs(&cluster), &[]).await;

        assert_eq!(sets.sets.len(), 2);
        let fast_set = sets.sets.iter().find(|s| s.signature == fast).unwrap();
        assert_eq!(fast_set.instances, vec![InstanceId::from("d")]);

        // Without a grouping report a and b have distinct stable ids, so both stay
        let other = sets.sets.iter().find(|s| s.signature != fast).unwrap();
        assert_eq!(
            other.instances,
            vec![InstanceId::from("a"), InstanceId::from("b"), InstanceId::from("c")]
        );
    }

    #[tokio::test]
    async fn test_groups_collapse_to_one_representative() {
        let cluster = SimulatedCluster::builder()
            .host(["b", "a"])
            .host(["c"])
            .build()
            .unwrap();
        let groups = vec![Group {
            lock: "b".into(),
            members: vec!["b".into(), "a".into()],
        }];

        let sets = prepare_candidate_sets(&fast_driver(), &pairs(&cluster), &groups).await;

        assert_eq!(sets.sets.len(), 1);
        assert_eq!(
            sets.sets[0].instances,
            vec![InstanceId::from("b"), InstanceId::from("c")]
        );
    }

    #[tokio::test]
    async fn test_known_signature_needs_only_identity() {
        let cluster = SimulatedCluster::builder()
            .host(["a"])
            .host(["b"])
            .build()
            .unwrap();
        let signature = HardwareSignature::from_brand("Xeon @ 2.60GHz");
        let mut instances: Vec<(InstanceDescriptor, InstanceHandle)> = pairs(&cluster)
            .into_iter()
            .map(|(descriptor, handle)| (descriptor.with_signature(signature.clone()), handle))
            .collect();

        // A second address of a reports the same stable id
        let alias = InstanceDescriptor::parse("http://a-alias.example/")
            .unwrap()
            .with_signature(signature.clone());
        let control = Arc::clone(&instances[0].1.control);
        instances.push((alias, InstanceHandle::new("a-alias".into(), control)));

        let sets = prepare_candidate_sets(&fast_driver(), &instances, &[]).await;

        assert_eq!(sets.sets.len(), 1);
        assert_eq!(
            sets.sets[0].instances,
            vec![InstanceId::from("a"), InstanceId::from("b")]
        );
        assert_eq!(cluster.probe_calls(), 0);
    }

    #[tokio::test]
    async fn test_stable_id_dedup_and_unknown_bucket() {
        let cluster = SimulatedCluster::builder()
            .host(["a"])
            .host(["b"])
            .host(["c"])
            .build()
            .unwrap();
        cluster.inject_fault(&"c".into(), Fault::Unreachable);

        let mut instances = pairs(&cluster);
        // Two descriptors naming the same stable id share a host
        instances[0].0 = instances[0].0.clone().with_stable_id("node-1");
        instances[1].0 = instances[1].0.clone().with_stable_id("node-1");

        let sets = prepare_candidate_sets(&fast_driver(), &instances, &[]).await;

        assert_eq!(sets.total_candidates(), 2);
        let unknown = sets
            .sets
            .iter()
            .find(|s| s.signature.cpu_brand == UNKNOWN_BUCKET)
            .unwrap();
        assert_eq!(unknown.instances, vec![InstanceId::from("c")]);
    }
}
