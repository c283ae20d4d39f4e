//! One lock-and-probe round
//!
//! A round starts the lock on one instance (or several, for localization),
//! waits out the warm-up, measures the targets concurrently and then
//! intersects every measurement with the contention window derived from the
//! lock call. Only measurements whose whole interval lies inside the window
//! are allowed to carry a verdict.

use cohost_core::{
    ContentionWindow, DriverConfig, HardwareSignature, InstanceControl, InstanceId,
    LocalizationConfig, LockAck, LockRequest, LockStatus, ProbeResult, VictimTarget,
};
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// An instance the driver can lock and probe
#[derive(Clone)]
pub struct InstanceHandle {
    pub id: InstanceId,
    pub control: Arc<dyn InstanceControl>,
}

impl InstanceHandle {
    pub fn new(id: InstanceId, control: Arc<dyn InstanceControl>) -> Self {
        Self { id, control }
    }
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceHandle").field("id", &self.id).finish()
    }
}

impl From<(InstanceId, Arc<dyn InstanceControl>)> for InstanceHandle {
    fn from((id, control): (InstanceId, Arc<dyn InstanceControl>)) -> Self {
        Self::new(id, control)
    }
}

/// One probe call and what it produced
#[derive(Debug, Clone)]
pub struct Observation {
    /// Instance the call was addressed to
    pub instance: InstanceId,

    pub result: ProbeResult,

    /// Stable id reported by whoever served the call
    pub served_by: Option<String>,

    pub signature: Option<HardwareSignature>,

    /// The call errored or timed out
    pub call_failed: bool,

    /// A failed call that a later attempt might still get through
    pub retryable: bool,

    pub started: Instant,
    pub finished: Instant,
}

/// What became of the lock call of a round
#[derive(Debug)]
pub enum LockOutcome {
    Applied {
        ack: LockAck,
        window: ContentionWindow,
    },
    Failed {
        error: cohost_core::Error,
    },
}

impl LockOutcome {
    pub fn window(&self) -> Option<&ContentionWindow> {
        match self {
            LockOutcome::Applied { window, .. } => Some(window),
            LockOutcome::Failed { .. } => None,
        }
    }
}

/// Result of a lock-and-probe round
#[derive(Debug)]
pub struct RoundReport {
    pub round: u64,
    pub lock: InstanceId,
    pub lock_outcome: LockOutcome,

    /// One observation per target, in target order
    pub observations: Vec<Observation>,

    /// Too many probe calls failed for the round to be trusted
    pub aborted: bool,
}

impl RoundReport {
    pub fn lock_applied(&self) -> bool {
        matches!(self.lock_outcome, LockOutcome::Applied { .. })
    }

    pub fn failed_calls(&self) -> usize {
        self.observations.iter().filter(|o| o.call_failed).count()
    }
}

/// Result of one victim-timing round
#[derive(Debug, Clone)]
pub struct VictimRound {
    pub round: u64,

    /// Median latency of the victim requests inside the window
    pub latency_ms: Option<f64>,

    /// Victim requests that landed inside the window
    pub samples: usize,

    /// Locked instances whose lock call failed
    pub failed_locks: Vec<InstanceId>,
}

impl VictimRound {
    pub fn is_confident(&self, min_samples: usize) -> bool {
        self.failed_locks.is_empty() && self.latency_ms.is_some() && self.samples >= min_samples
    }
}

type LockTask = JoinHandle<(cohost_core::Result<LockAck>, Instant)>;

/// Executes rounds according to a [`DriverConfig`]
#[derive(Debug, Clone)]
pub struct ProbeDriver {
    config: DriverConfig,
}

impl ProbeDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Lock `lock`, then probe every target while the contention holds
    pub async fn lock_and_probe(
        &self,
        lock: &InstanceHandle,
        targets: &[InstanceHandle],
        round: u64,
    ) -> RoundReport {
        let request = self.config.lock_request(round);
        debug!(
            "Round {}: locking {} ({} workers, {}) against {} targets",
            round,
            lock.id,
            request.workers,
            request.mode,
            targets.len()
        );

        let sent = Instant::now();
        let lock_task = self.start_lock(Arc::clone(&lock.control), request.clone());
        tokio::time::sleep(self.config.warmup()).await;

        let mut observations = join_all(targets.iter().map(|t| self.probe(t))).await;
        let (lock_result, returned) = join_lock(lock_task).await;

        let lock_outcome = match lock_result {
            Ok(ack) if ack.status == LockStatus::AlreadyActive => LockOutcome::Failed {
                error: cohost_core::Error::unavailable(format!(
                    "{} already runs a detached lock",
                    lock.id
                )),
            },
            Ok(ack) => {
                let window = self.window(sent, returned, &request);
                LockOutcome::Applied { ack, window }
            }
            Err(error) => {
                warn!("Round {}: lock on {} failed: {}", round, lock.id, error);
                LockOutcome::Failed { error }
            }
        };

        if let Some(window) = lock_outcome.window() {
            for observation in observations.iter_mut() {
                if observation.result.is_confident()
                    && !window.contains(observation.started, observation.finished)
                {
                    debug!(
                        "Round {}: probe of {} fell outside the contention window",
                        round, observation.instance
                    );
                    observation.result = observation.result.clone().outside_window();
                }
            }
        }

        let failed = observations.iter().filter(|o| o.call_failed).count();
        let aborted = self.should_abort(failed, targets.len());
        if aborted {
            warn!(
                "Round {}: {} of {} probe calls failed, discarding round",
                round,
                failed,
                targets.len()
            );
        }

        if request.detach {
            if let Some(window) = lock_outcome.window() {
                self.settle_until(window.end).await;
            }
        }

        RoundReport {
            round,
            lock: lock.id.clone(),
            lock_outcome,
            observations,
            aborted,
        }
    }

    /// Lock every instance in `locks` and time the victim meanwhile
    pub async fn lock_and_time_victim(
        &self,
        locks: &[InstanceHandle],
        victim: &dyn VictimTarget,
        localization: &LocalizationConfig,
        round: u64,
    ) -> VictimRound {
        let request = self.config.lock_request(round);
        debug!(
            "Round {}: locking {} instances while timing the victim",
            round,
            locks.len()
        );

        let sent = Instant::now();
        let tasks: Vec<(InstanceId, LockTask)> = locks
            .iter()
            .map(|h| {
                (
                    h.id.clone(),
                    self.start_lock(Arc::clone(&h.control), request.clone()),
                )
            })
            .collect();
        tokio::time::sleep(self.config.warmup()).await;

        let mut timings = Vec::with_capacity(localization.victim_runs);
        for _ in 0..localization.victim_runs {
            let started = Instant::now();
            match tokio::time::timeout(localization.victim_timeout(), victim.request()).await {
                Ok(Ok(latency)) => timings.push((started, Instant::now(), latency)),
                Ok(Err(e)) => warn!("Round {}: victim request failed: {}", round, e),
                Err(_) => warn!("Round {}: victim request timed out", round),
            }
        }

        let results = join_all(
            tasks
                .into_iter()
                .map(|(id, task)| async move { (id, join_lock(task).await) }),
        )
        .await;

        let mut failed_locks = Vec::new();
        let mut earliest_return: Option<Instant> = None;
        for (id, (result, returned)) in results {
            match result {
                Ok(ack) if ack.status != LockStatus::AlreadyActive => {
                    earliest_return = Some(earliest_return.map_or(returned, |e| e.min(returned)));
                }
                Ok(_) => {
                    warn!("Round {}: {} already runs a detached lock", round, id);
                    failed_locks.push(id);
                }
                Err(e) => {
                    warn!("Round {}: lock on {} failed: {}", round, id, e);
                    failed_locks.push(id);
                }
            }
        }

        let window = earliest_return.map(|returned| self.window(sent, returned, &request));
        let in_window: Vec<f64> = match &window {
            Some(window) => timings
                .iter()
                .filter(|(started, finished, _)| window.contains(*started, *finished))
                .map(|(_, _, latency)| latency.as_secs_f64() * 1000.0)
                .collect(),
            None => Vec::new(),
        };

        if request.detach {
            if let Some(window) = &window {
                self.settle_until(window.end).await;
            }
        }

        VictimRound {
            round,
            latency_ms: cohost_core::median(&in_window),
            samples: in_window.len(),
            failed_locks,
        }
    }

    /// Probe one instance with the request timeout applied
    pub async fn probe(&self, target: &InstanceHandle) -> Observation {
        self.probe_control(target.id.clone(), target.control.as_ref())
            .await
    }

    /// Probe through any control handle; `instance` names the addressee
    pub async fn probe_control(
        &self,
        instance: InstanceId,
        control: &dyn InstanceControl,
    ) -> Observation {
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.request_timeout(),
            control.probe(self.config.probe_repetitions),
        )
        .await;
        let finished = Instant::now();

        let failure = |message: String, retryable: bool| Observation {
            instance: instance.clone(),
            result: ProbeResult::failed(instance.clone(), message),
            served_by: None,
            signature: None,
            call_failed: true,
            retryable,
            started,
            finished,
        };

        match outcome {
            Ok(Ok(report)) => {
                let result = ProbeResult::from_samples(
                    instance.clone(),
                    &report.samples,
                    self.config.aggregate,
                    &self.config.confidence_policy(),
                );
                Observation {
                    instance,
                    result,
                    served_by: report.stable_id,
                    signature: Some(report.hardware_signature),
                    call_failed: false,
                    retryable: false,
                    started,
                    finished,
                }
            }
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", instance, e);
                failure(e.to_string(), e.is_retryable())
            }
            Err(_) => {
                debug!("Probe of {} timed out", instance);
                failure(
                    format!("probe timed out after {:?}", self.config.request_timeout()),
                    true,
                )
            }
        }
    }

    /// Whether `failed` of `total` failed calls exceed the abort ratio
    pub fn should_abort(&self, failed: usize, total: usize) -> bool {
        total > 0 && (failed as f64 / total as f64) > self.config.abort_failure_ratio
    }

    /// Sleep until `end` plus the settle delay
    pub async fn settle_until(&self, end: Instant) {
        let deadline = end + self.config.settle();
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }

    /// Contention window of a lock sent at `sent` that returned at `returned`
    pub fn window(&self, sent: Instant, returned: Instant, request: &LockRequest) -> ContentionWindow {
        let start = sent + self.config.warmup();
        let end = if request.detach {
            sent + request.duration()
        } else {
            returned
        };
        ContentionWindow::new(start, end)
    }

    fn start_lock(&self, control: Arc<dyn InstanceControl>, request: LockRequest) -> LockTask {
        let timeout = if request.detach {
            self.config.request_timeout()
        } else {
            self.config.request_timeout() + request.duration()
        };

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, control.lock(&request)).await {
                Ok(result) => result,
                Err(_) => Err(cohost_core::Error::timeout(format!(
                    "lock did not return within {:?}",
                    timeout
                ))),
            };
            (result, Instant::now())
        })
    }
}

async fn join_lock(task: LockTask) -> (cohost_core::Result<LockAck>, Instant) {
    match task.await {
        Ok(outcome) => outcome,
        Err(e) => (
            Err(cohost_core::Error::internal(format!("lock task failed: {}", e))),
            Instant::now(),
        ),
    }
}
