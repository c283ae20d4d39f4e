//! Baseline measurement without contention

use crate::round::{InstanceHandle, ProbeDriver};
use cohost_core::{BaselineReport, InstanceBaseline, SampleStats};
use futures::future::join_all;
use tracing::{debug, info, warn};

/// Probe every instance `batches` times with no lock active
///
/// Per-instance statistics cover every raw sample collected from that
/// instance; pooled statistics cover the per-instance aggregates. Instances
/// that never answer are listed as unreachable.
pub async fn measure_baseline(
    driver: &ProbeDriver,
    instances: &[InstanceHandle],
    batches: usize,
) -> BaselineReport {
    info!(
        "Measuring baseline of {} instances over {} batches",
        instances.len(),
        batches
    );

    let timeout = driver.config().request_timeout();
    let repetitions = driver.config().probe_repetitions;
    let measured = join_all(instances.iter().map(|handle| async move {
        let mut samples = Vec::new();
        for batch in 0..batches {
            match tokio::time::timeout(timeout, handle.control.probe(repetitions)).await {
                Ok(Ok(report)) => samples.extend(report.samples),
                Ok(Err(e)) => debug!("Baseline batch {} of {} failed: {}", batch, handle.id, e),
                Err(_) => debug!("Baseline batch {} of {} timed out", batch, handle.id),
            }
        }
        (handle.id.clone(), samples)
    }))
    .await;

    let aggregate = driver.config().aggregate;
    let mut report = BaselineReport::default();

    for (instance_id, samples) in measured {
        if samples.is_empty() {
            warn!("No baseline samples from {}", instance_id);
            report.unreachable.push(instance_id);
            continue;
        }

        let stats = SampleStats::from_samples(&samples);
        debug!(
            "Baseline of {}: {} samples, {} {:.1}",
            instance_id,
            stats.count,
            aggregate,
            stats.aggregate(aggregate)
        );
        report.instances.push(InstanceBaseline { instance_id, stats });
    }

    let pooled: Vec<f64> = report
        .instances
        .iter()
        .map(|i| i.stats.aggregate(aggregate))
        .collect();
    report.pooled = SampleStats::from_values(&pooled);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_driver, handles};
    use cohost_dev::{two_by_two_cluster, Fault};

    #[tokio::test]
    async fn test_baseline_statistics() {
        let cluster = two_by_two_cluster().unwrap();
        cluster.inject_fault(&"d".into(), Fault::Unreachable);

        let report = measure_baseline(&fast_driver(), &handles(&cluster), 3).await;

        assert_eq!(report.instances.len(), 3);
        assert_eq!(report.unreachable, vec![cohost_core::InstanceId::from("d")]);
        for instance in &report.instances {
            assert_eq!(instance.stats.count, 300);
            assert!((instance.stats.mean - 200.0).abs() < 10.0);
            assert!(instance.stats.p95 >= instance.stats.median);
        }
        assert_eq!(report.pooled.count, 3);
        assert_eq!(cluster.lock_calls(), 0);
    }
}
