//! Prometheus metrics of the instance agent

use crate::error::{AgentError, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Counters and histograms exported on `/metrics`
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    pub lock_requests: IntCounterVec,
    pub lock_failures: IntCounter,
    pub lock_stops: IntCounter,
    pub active_locks: IntGauge,
    pub probe_requests: IntCounter,
    pub probe_failures: IntCounter,
    pub probe_metric: Histogram,
}

impl AgentMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let lock_requests = IntCounterVec::new(
            Opts::new("cohost_agent_lock_requests_total", "Lock requests by mode and outcome"),
            &["mode", "status"],
        )?;
        let lock_failures = IntCounter::new(
            "cohost_agent_lock_failures_total",
            "Lock requests that failed to set up contention",
        )?;
        let lock_stops = IntCounter::new(
            "cohost_agent_lock_stops_total",
            "Detached locks ended by a stop request",
        )?;
        let active_locks = IntGauge::new(
            "cohost_agent_active_locks",
            "Contention runs currently in progress",
        )?;
        let probe_requests =
            IntCounter::new("cohost_agent_probe_requests_total", "Probe batches served")?;
        let probe_failures = IntCounter::new(
            "cohost_agent_probe_failures_total",
            "Probe requests that failed to set up the probe",
        )?;
        let probe_metric = Histogram::with_opts(
            HistogramOpts::new("cohost_agent_probe_metric", "Mean reload latency per batch")
                .buckets(prometheus::exponential_buckets(16.0, 2.0, 12)?),
        )?;

        registry.register(Box::new(lock_requests.clone()))?;
        registry.register(Box::new(lock_failures.clone()))?;
        registry.register(Box::new(lock_stops.clone()))?;
        registry.register(Box::new(active_locks.clone()))?;
        registry.register(Box::new(probe_requests.clone()))?;
        registry.register(Box::new(probe_failures.clone()))?;
        registry.register(Box::new(probe_metric.clone()))?;

        Ok(Self {
            registry,
            lock_requests,
            lock_failures,
            lock_stops,
            active_locks,
            probe_requests,
            probe_failures,
            probe_metric,
        })
    }

    /// Render every metric in the Prometheus text format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| AgentError::Internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| AgentError::Internal(format!("Metrics are not valid UTF-8: {}", e)))
    }
}
