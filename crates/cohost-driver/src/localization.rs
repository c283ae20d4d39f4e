//! Victim localization by bisection over a candidate pool
//!
//! Each round locks the first half of the pool and times the victim. A
//! latency above θ keeps the locked half, anything else keeps the rest. The
//! last candidate is locked alone once more to confirm the signal.

use crate::error::{DriverError, Result};
use crate::round::{InstanceHandle, ProbeDriver};
use cohost_core::{
    exceeds, DriverConfig, InstanceId, LocalizationConfig, LocalizationOutcome,
    LocalizationReport, NotFoundReason, VictimTarget,
};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Outcome of measuring the victim under one set of locks
enum Measurement {
    Latency(f64),
    /// Retries exhausted with these locks still failing
    LocksFailed(Vec<InstanceId>),
    /// Retries exhausted without enough victim samples
    Unmeasurable,
}

#[derive(Default)]
struct SearchState {
    next_round: u64,
    rounds: u32,
    retried_rounds: u32,
    screen_rounds: u32,
    unreachable: Vec<InstanceId>,
}

impl SearchState {
    fn drop_unreachable(&mut self, pool: &mut Vec<InstanceHandle>, failed: Vec<InstanceId>) {
        for id in &failed {
            warn!("Dropping {} after repeated lock failures", id);
        }
        let failed: HashSet<InstanceId> = failed.into_iter().collect();
        pool.retain(|h| !failed.contains(&h.id));
        self.unreachable.extend(failed);
    }
}

/// Finds the candidate that shares a host with a victim
#[derive(Debug, Clone)]
pub struct VictimLocator {
    driver: ProbeDriver,
    config: LocalizationConfig,
    threshold_ms: f64,
}

impl VictimLocator {
    /// Build from configuration; fails when θ is not configured
    pub fn new(driver: DriverConfig, config: LocalizationConfig) -> cohost_core::Result<Self> {
        driver.validate()?;
        config.validate()?;
        let threshold_ms = config.require_threshold()?;
        Ok(Self::with_threshold(ProbeDriver::new(driver), config, threshold_ms))
    }

    pub fn with_threshold(driver: ProbeDriver, config: LocalizationConfig, threshold_ms: f64) -> Self {
        Self {
            driver,
            config,
            threshold_ms,
        }
    }

    /// Bisect `candidates`, one representative per host
    pub async fn localize(
        &self,
        candidates: Vec<InstanceHandle>,
        victim: &dyn VictimTarget,
    ) -> Result<LocalizationReport> {
        check_unique(candidates.iter())?;
        info!(
            "Localizing victim among {} candidates, threshold {} ms",
            candidates.len(),
            self.threshold_ms
        );

        let mut state = SearchState::default();
        let outcome = self.bisect(candidates, victim, &mut state).await;
        Ok(self.report(outcome, state, None))
    }

    /// Lock whole candidate sets until one moves the victim, then bisect it
    pub async fn screen_and_localize(
        &self,
        sets: Vec<Vec<InstanceHandle>>,
        victim: &dyn VictimTarget,
    ) -> Result<LocalizationReport> {
        check_unique(sets.iter().flatten())?;
        info!(
            "Screening {} candidate sets, threshold {} ms",
            sets.len(),
            self.threshold_ms
        );

        let mut state = SearchState::default();
        let mut any_candidates = false;

        for (index, mut set) in sets.into_iter().enumerate() {
            while !set.is_empty() {
                any_candidates = true;
                match self.measure(&set, victim, &mut state).await {
                    Measurement::Latency(latency_ms) => {
                        state.screen_rounds += 1;
                        if !exceeds(latency_ms, self.threshold_ms) {
                            debug!("Set {}: victim at {:.2} ms, skipping", index, latency_ms);
                            break;
                        }

                        info!("Set {}: victim at {:.2} ms, searching it", index, latency_ms);
                        let outcome = self.bisect(set, victim, &mut state).await;
                        return Ok(self.report(outcome, state, Some(index)));
                    }
                    Measurement::LocksFailed(failed) => state.drop_unreachable(&mut set, failed),
                    Measurement::Unmeasurable => {
                        let outcome =
                            LocalizationOutcome::NotFound(NotFoundReason::VictimUnmeasurable);
                        return Ok(self.report(outcome, state, Some(index)));
                    }
                }
            }
        }

        let reason = if any_candidates {
            NotFoundReason::NoSetExceeded
        } else {
            NotFoundReason::EmptyPool
        };
        Ok(self.report(LocalizationOutcome::NotFound(reason), state, None))
    }

    async fn bisect(
        &self,
        mut pool: Vec<InstanceHandle>,
        victim: &dyn VictimTarget,
        state: &mut SearchState,
    ) -> LocalizationOutcome {
        loop {
            if pool.is_empty() {
                let reason = if state.unreachable.is_empty() {
                    NotFoundReason::EmptyPool
                } else {
                    NotFoundReason::AllUnreachable
                };
                return LocalizationOutcome::NotFound(reason);
            }

            let split = if pool.len() == 1 { 1 } else { pool.len() / 2 };
            match self.measure(&pool[..split], victim, state).await {
                Measurement::Latency(latency_ms) => {
                    state.rounds += 1;
                    let exceeded = exceeds(latency_ms, self.threshold_ms);

                    if pool.len() == 1 {
                        let candidate = pool.remove(0).id;
                        return if exceeded {
                            info!("Confirmed {} at {:.2} ms", candidate, latency_ms);
                            LocalizationOutcome::Found {
                                instance: candidate,
                                latency_ms,
                            }
                        } else {
                            info!("{} did not reproduce the signal ({:.2} ms)", candidate, latency_ms);
                            LocalizationOutcome::NotFound(NotFoundReason::ConfirmationFailed {
                                candidate,
                                latency_ms,
                            })
                        };
                    }

                    debug!(
                        "Round {}: locked {} of {}, victim at {:.2} ms",
                        state.rounds,
                        split,
                        pool.len(),
                        latency_ms
                    );
                    if exceeded {
                        pool.truncate(split);
                    } else {
                        pool.drain(..split);
                    }
                }
                Measurement::LocksFailed(failed) => state.drop_unreachable(&mut pool, failed),
                Measurement::Unmeasurable => {
                    return LocalizationOutcome::NotFound(NotFoundReason::VictimUnmeasurable)
                }
            }
        }
    }

    /// Time the victim under `locked`, retrying unusable rounds
    async fn measure(
        &self,
        locked: &[InstanceHandle],
        victim: &dyn VictimTarget,
        state: &mut SearchState,
    ) -> Measurement {
        let retries = self.driver.config().max_round_retries;
        let mut failed_locks = Vec::new();

        for attempt in 0..=retries {
            if attempt > 0 {
                state.retried_rounds += 1;
            }
            let round = state.next_round;
            state.next_round += 1;

            let outcome = self
                .driver
                .lock_and_time_victim(locked, victim, &self.config, round)
                .await;

            if outcome.is_confident(self.config.min_victim_samples) {
                if let Some(latency_ms) = outcome.latency_ms {
                    return Measurement::Latency(latency_ms);
                }
            }

            if outcome.failed_locks.is_empty() {
                debug!(
                    "Round {}: only {} victim samples, retrying",
                    round, outcome.samples
                );
            }
            failed_locks = outcome.failed_locks;
        }

        if failed_locks.is_empty() {
            Measurement::Unmeasurable
        } else {
            Measurement::LocksFailed(failed_locks)
        }
    }

    fn report(
        &self,
        outcome: LocalizationOutcome,
        state: SearchState,
        searched_set: Option<usize>,
    ) -> LocalizationReport {
        LocalizationReport {
            threshold_ms: self.threshold_ms,
            outcome,
            rounds: state.rounds,
            retried_rounds: state.retried_rounds,
            screen_rounds: state.screen_rounds,
            searched_set,
            unreachable: state.unreachable,
        }
    }
}

fn check_unique<'a>(handles: impl Iterator<Item = &'a InstanceHandle>) -> Result<()> {
    let mut seen = HashSet::new();
    for handle in handles {
        if !seen.insert(&handle.id) {
            return Err(DriverError::InvalidInput(format!(
                "Duplicate candidate {}",
                handle.id
            )));
        }
    }
    Ok(())
}
