//! The instance agent: lock, probe and identity over local primitives

use crate::error::{AgentError, Result};
use crate::metrics::AgentMetrics;
use cohost_core::{AgentConfig, HardwareSignature, Identity, LockAck, LockRequest, LockStatus, ProbeReport};
use cohost_probe::{
    hardware_signature, stable_instance_id, ContentionConfig, ContentionGenerator, ProbeTarget,
    TimingProbe,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Upper bound on repetitions of a single probe request
pub const MAX_PROBE_REPETITIONS: usize = 100_000;

/// Stop flag of the detached run, if one is running
type DetachedSlot = Arc<Mutex<Option<Arc<AtomicBool>>>>;

fn slot(detached: &DetachedSlot) -> MutexGuard<'_, Option<Arc<AtomicBool>>> {
    detached.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frees the detached slot and the active gauge when a run ends
struct RunGuard {
    detached: Option<(DetachedSlot, Arc<AtomicBool>)>,
    metrics: AgentMetrics,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some((detached, stop)) = &self.detached {
            let mut current = slot(detached);
            // A stopped run may already have been replaced by a newer one
            if current.as_ref().is_some_and(|flag| Arc::ptr_eq(flag, stop)) {
                *current = None;
            }
        }
        self.metrics.active_locks.dec();
    }
}

/// Agent state shared by all request handlers
pub struct InstanceAgent {
    config: AgentConfig,
    generator: ContentionGenerator,
    probe: OnceCell<Arc<TimingProbe>>,
    signature: HardwareSignature,
    stable_id: String,
    detached: DetachedSlot,
    shutdown: Arc<AtomicBool>,
    metrics: AgentMetrics,
}

impl InstanceAgent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let generator = ContentionGenerator::new(ContentionConfig::from(&config))?;
        let signature = hardware_signature();
        let stable_id = stable_instance_id().to_string();

        info!("Creating instance agent {} on {}", stable_id, signature);

        Ok(Self {
            config,
            generator,
            probe: OnceCell::new(),
            signature,
            stable_id,
            detached: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics: AgentMetrics::new()?,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    pub fn signature(&self) -> &HardwareSignature {
        &self.signature
    }

    pub fn identity(&self) -> Identity {
        Identity {
            stable_id: self.stable_id.clone(),
        }
    }

    /// Ask running contention workers to stop
    pub fn shutdown(&self) {
        info!("Stopping contention workers");
        self.shutdown.store(true, Ordering::Release);
        if let Some(stop) = slot(&self.detached).take() {
            stop.store(true, Ordering::Release);
        }
    }

    /// Stop the running detached lock
    pub fn stop(&self) -> LockAck {
        match slot(&self.detached).take() {
            Some(stop) => {
                info!("Stopping detached lock");
                stop.store(true, Ordering::Release);
                self.metrics.lock_stops.inc();
                self.ack(LockStatus::Stopped, 0)
            }
            None => {
                debug!("Stop requested with no detached lock running");
                self.ack(LockStatus::NotActive, 0)
            }
        }
    }

    /// Run the contention generator; detached requests return immediately
    pub async fn lock(&self, request: LockRequest) -> Result<LockAck> {
        self.validate_lock(&request)?;
        let mode = request.mode.as_str();

        if request.detach {
            let stop = {
                let mut current = slot(&self.detached);
                if current.is_some() {
                    debug!("Detached lock requested while one is active");
                    self.metrics
                        .lock_requests
                        .with_label_values(&[mode, "already_active"])
                        .inc();
                    return Ok(self.ack(LockStatus::AlreadyActive, 0));
                }
                let stop = Arc::new(AtomicBool::new(self.shutdown.load(Ordering::Acquire)));
                *current = Some(Arc::clone(&stop));
                stop
            };

            let guard = self.run_guard(Some((Arc::clone(&self.detached), Arc::clone(&stop))));
            let generator = self.generator.clone();
            let metrics = self.metrics.clone();
            if request.until_stopped {
                info!("Starting detached {} lock until stopped", request.mode);
            } else {
                info!(
                    "Starting detached {} lock for {:?}",
                    request.mode,
                    request.duration()
                );
            }

            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                if let Err(e) = generator.run(&request, &stop) {
                    warn!("Detached lock failed: {}", e);
                    metrics.lock_failures.inc();
                }
            });

            self.metrics
                .lock_requests
                .with_label_values(&[mode, "started"])
                .inc();
            return Ok(self.ack(LockStatus::Started, 0));
        }

        let guard = self.run_guard(None);
        let generator = self.generator.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let started = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            generator.run(&request, &shutdown)
        })
        .await
        .map_err(|e| AgentError::Internal(format!("Contention task failed: {}", e)))?;

        match outcome {
            Ok(summary) => {
                debug!(
                    "Lock finished: {} operations in {:?}",
                    summary.operations, summary.elapsed
                );
                self.metrics
                    .lock_requests
                    .with_label_values(&[mode, "completed"])
                    .inc();
                Ok(self.ack(
                    LockStatus::Completed,
                    started.elapsed().as_millis() as u64,
                ))
            }
            Err(e) => {
                self.metrics.lock_failures.inc();
                Err(e.into())
            }
        }
    }

    /// Take one probe batch; `repetitions` overrides the configured count
    pub async fn probe(&self, repetitions: Option<usize>) -> Result<ProbeReport> {
        let repetitions = repetitions.unwrap_or(self.config.probe_repetitions);
        if repetitions == 0 || repetitions > MAX_PROBE_REPETITIONS {
            return Err(AgentError::InvalidRequest(format!(
                "repetitions must be within 1..={}",
                MAX_PROBE_REPETITIONS
            )));
        }

        let probe = match self.timing_probe().await {
            Ok(probe) => probe,
            Err(e) => {
                self.metrics.probe_failures.inc();
                return Err(e);
            }
        };

        let batch = tokio::task::spawn_blocking(move || probe.measure_n(repetitions))
            .await
            .map_err(|e| AgentError::Internal(format!("Probe task failed: {}", e)))?;

        self.metrics.probe_requests.inc();
        self.metrics.probe_metric.observe(batch.metric);

        Ok(ProbeReport {
            metric: batch.metric,
            samples: batch.samples,
            hardware_signature: self.signature.clone(),
            stable_id: Some(self.stable_id.clone()),
        })
    }

    /// Open the probe on first use; a failed open is retried on the next call
    async fn timing_probe(&self) -> Result<Arc<TimingProbe>> {
        let probe = self
            .probe
            .get_or_try_init(|| async {
                let target = ProbeTarget::from(&self.config);
                let repetitions = self.config.probe_repetitions;
                tokio::task::spawn_blocking(move || TimingProbe::open(&target, repetitions))
                    .await
                    .map_err(|e| AgentError::Internal(format!("Probe setup task failed: {}", e)))?
                    .map(Arc::new)
                    .map_err(AgentError::from)
            })
            .await?;
        Ok(Arc::clone(probe))
    }

    fn validate_lock(&self, request: &LockRequest) -> Result<()> {
        if request.until_stopped {
            if !request.detach {
                return Err(AgentError::InvalidRequest(
                    "until_stopped requires detach".to_string(),
                ));
            }
        } else {
            if request.duration_ms == 0 {
                return Err(AgentError::InvalidRequest("duration_ms must be > 0".to_string()));
            }
            if request.duration() > self.config.max_lock_duration() {
                return Err(AgentError::InvalidRequest(format!(
                    "duration_ms must not exceed {}",
                    self.config.max_lock_duration_ms
                )));
            }
        }
        if request.workers == 0 || request.workers > self.config.max_lock_workers {
            return Err(AgentError::InvalidRequest(format!(
                "workers must be within 1..={}",
                self.config.max_lock_workers
            )));
        }
        Ok(())
    }

    fn run_guard(&self, detached: Option<(DetachedSlot, Arc<AtomicBool>)>) -> RunGuard {
        self.metrics.active_locks.inc();
        RunGuard {
            detached,
            metrics: self.metrics.clone(),
        }
    }

    fn ack(&self, status: LockStatus, elapsed_ms: u64) -> LockAck {
        LockAck {
            status,
            stable_id: Some(self.stable_id.clone()),
            elapsed_ms,
        }
    }
}
