//! Background contention command

use anyhow::{Context, Result};
use cohost_core::{CohostConfig, InstanceControl, LockAck, LockRequest, LockStatus};
use tracing::{info, warn};

/// Start a detached lock on one agent
///
/// Without a duration the lock runs until [`stop`] is called.
pub async fn start(
    config: &CohostConfig,
    control: &dyn InstanceControl,
    duration_ms: Option<u64>,
) -> Result<LockAck> {
    let base = config.driver.lock_request(0);
    let request = match duration_ms {
        Some(duration_ms) => LockRequest {
            duration_ms,
            ..base
        }
        .detached(),
        None => base.continuous(),
    };

    let ack = control
        .lock(&request)
        .await
        .context("Failed to start contention")?;
    match ack.status {
        LockStatus::AlreadyActive => warn!("Contention already running on the agent"),
        _ => info!(
            "Contention started with {} workers in {} mode",
            request.workers,
            request.mode.as_str()
        ),
    }
    Ok(ack)
}

pub async fn stop(control: &dyn InstanceControl) -> Result<LockAck> {
    let ack = control.stop().await.context("Failed to stop contention")?;
    if ack.status == LockStatus::NotActive {
        warn!("No contention was running on the agent");
    }
    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::fast_config;
    use cohost_dev::two_by_two_cluster;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_and_stop() {
        let cluster = two_by_two_cluster().unwrap();
        let a = cluster.instance(&"a".into()).unwrap();
        let config = fast_config();

        assert_eq!(stop(&a).await.unwrap().status, LockStatus::NotActive);

        let ack = start(&config, &a, None).await.unwrap();
        assert_eq!(ack.status, LockStatus::Started);
        tokio::time::sleep(Duration::from_millis(config.driver.lock_duration_ms * 2)).await;
        assert!(cluster.is_host_active(0));

        let ack = start(&config, &a, None).await.unwrap();
        assert_eq!(ack.status, LockStatus::AlreadyActive);

        assert_eq!(stop(&a).await.unwrap().status, LockStatus::Stopped);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!cluster.is_host_active(0));
    }

    #[tokio::test]
    async fn test_bounded_start_ends_on_its_own() {
        let cluster = two_by_two_cluster().unwrap();
        let a = cluster.instance(&"a".into()).unwrap();

        let ack = start(&fast_config(), &a, Some(20)).await.unwrap();
        assert_eq!(ack.status, LockStatus::Started);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!cluster.is_host_active(0));
        assert_eq!(stop(&a).await.unwrap().status, LockStatus::NotActive);
    }
}
