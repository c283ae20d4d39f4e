//! Victim localization command

use anyhow::{anyhow, Context, Result};
use cohost_core::{
    CandidateSets, CohostConfig, DriverConfig, InstanceDescriptor, LocalizationReport,
    VictimTarget,
};
use cohost_driver::{connect_instances, HttpVictim, InstanceHandle, VictimLocator};
use tracing::info;

/// Where the candidates of a search come from
#[derive(Debug)]
pub enum Candidates {
    /// A flat pool, bisected directly
    Pool(Vec<InstanceHandle>),
    /// Prepared sets, screened one by one before bisection
    Sets(Vec<Vec<InstanceHandle>>),
}

impl Candidates {
    /// Connect to every instance of prepared candidate sets
    pub fn from_sets(driver: &DriverConfig, sets: &CandidateSets) -> Result<Self> {
        let mut connected = Vec::with_capacity(sets.sets.len());
        for set in &sets.sets {
            let descriptors = set
                .instances
                .iter()
                .map(|id| InstanceDescriptor::parse(id.as_str()))
                .collect::<cohost_core::Result<Vec<_>>>()
                .context("Candidate sets must list instance endpoints")?;
            connected.push(connect_instances(&descriptors, driver.request_timeout())?);
        }
        Ok(Candidates::Sets(connected))
    }
}

/// HTTP victim at the configured URL
pub fn http_victim(config: &CohostConfig) -> Result<HttpVictim> {
    let url = config
        .localization
        .victim_url
        .clone()
        .ok_or_else(|| anyhow!("No victim URL: pass --victim or set localization.victim_url"))?;
    Ok(HttpVictim::new(url, config.localization.victim_timeout())?)
}

/// Find the candidate sharing a host with `victim`
pub async fn localize(
    config: &CohostConfig,
    candidates: Candidates,
    victim: &dyn VictimTarget,
) -> Result<LocalizationReport> {
    let locator = VictimLocator::new(config.driver.clone(), config.localization.clone())
        .context("Invalid localization configuration")?;

    let report = match candidates {
        Candidates::Pool(pool) => locator.localize(pool, victim).await?,
        Candidates::Sets(sets) => locator.screen_and_localize(sets, victim).await?,
    };

    match report.found() {
        Some(instance) => info!("Victim co-resident with {} after {} rounds", instance, report.rounds),
        None => info!("Victim not localized after {} rounds", report.rounds),
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::fast_config;
    use cohost_core::{CandidateSet, HardwareSignature, InstanceId};
    use cohost_dev::{singleton_hosts, SimulatedCluster, SimulatedVictim, VictimConfig};

    fn handles(cluster: &SimulatedCluster) -> Vec<InstanceHandle> {
        cluster.handles().into_iter().map(InstanceHandle::from).collect()
    }

    #[tokio::test]
    async fn test_localize_pool() {
        let cluster = singleton_hosts(6).unwrap();
        let victim = SimulatedVictim::new(&cluster, Some(&"cand-2".into()), VictimConfig::default());

        let report = localize(&fast_config(), Candidates::Pool(handles(&cluster)), &victim)
            .await
            .unwrap();

        assert_eq!(report.found().map(InstanceId::as_str), Some("cand-2"));
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_localize_sets() {
        let cluster = singleton_hosts(6).unwrap();
        let victim = SimulatedVictim::new(&cluster, Some(&"cand-4".into()), VictimConfig::default());
        let mut pool = handles(&cluster);
        let second = pool.split_off(3);

        let report = localize(&fast_config(), Candidates::Sets(vec![pool, second]), &victim)
            .await
            .unwrap();

        assert_eq!(report.found().map(InstanceId::as_str), Some("cand-4"));
        assert_eq!(report.searched_set, Some(1));
    }

    #[tokio::test]
    async fn test_isolated_victim_exit_code() {
        let cluster = singleton_hosts(2).unwrap();
        let victim = SimulatedVictim::isolated(&cluster, VictimConfig::default());

        let report = localize(&fast_config(), Candidates::Pool(handles(&cluster)), &victim)
            .await
            .unwrap();

        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn test_from_sets() {
        let sets = CandidateSets {
            sets: vec![CandidateSet {
                signature: HardwareSignature::unknown(),
                instances: vec!["http://10.0.0.1:8080/".into(), "http://10.0.0.2:8080/".into()],
            }],
        };

        match Candidates::from_sets(&DriverConfig::default(), &sets).unwrap() {
            Candidates::Sets(connected) => {
                assert_eq!(connected.len(), 1);
                assert_eq!(connected[0][1].id.as_str(), "http://10.0.0.2:8080/");
            }
            Candidates::Pool(_) => panic!("expected sets"),
        }

        let bad = CandidateSets {
            sets: vec![CandidateSet {
                signature: HardwareSignature::unknown(),
                instances: vec!["cand-0".into()],
            }],
        };
        assert!(Candidates::from_sets(&DriverConfig::default(), &bad).is_err());
    }

    #[test]
    fn test_victim_url_required() {
        assert!(http_victim(&fast_config()).is_err());

        let mut config = fast_config();
        config.localization.victim_url = Some("http://victim.example/".parse().unwrap());
        assert!(http_victim(&config).is_ok());
    }
}
