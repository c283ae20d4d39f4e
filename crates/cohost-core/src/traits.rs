//! Capability traits for cohost
//!
//! [`InstanceControl`] is the surface every instance exposes: lock, probe,
//! identity and stopping a background lock. It is implemented by the HTTP
//! transport and by the simulation harness.
//! [`VictimTarget`] is the single timed request the localization search needs.

use crate::{HardwareSignature, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of shared resource a lock stresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionMode {
    /// Split-lock atomics on a cache-line-straddling region
    #[default]
    MemoryBus,
    /// Random read-modify-write walk over a buffer larger than the LLC
    Llc,
}

impl ContentionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentionMode::MemoryBus => "memory_bus",
            ContentionMode::Llc => "llc",
        }
    }
}

impl std::fmt::Display for ContentionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentionMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory_bus" | "memory-bus" | "bus" => Ok(ContentionMode::MemoryBus),
            "llc" => Ok(ContentionMode::Llc),
            other => Err(crate::Error::invalid_request(format!(
                "unknown contention mode '{}'",
                other
            ))),
        }
    }
}

/// Parameters of one lock invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockRequest {
    pub duration_ms: u64,
    pub workers: usize,
    pub mode: ContentionMode,
    /// Seed of the access-order generator
    pub seed: u64,
    /// Return immediately and run the generator in the background
    pub detach: bool,
    /// Ignore the duration and run detached until `stop` is called
    pub until_stopped: bool,
}

impl LockRequest {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Deadline of a run started now; `None` for until-stopped runs
    pub fn deadline(&self, started: std::time::Instant) -> Option<std::time::Instant> {
        (!self.until_stopped).then(|| started + self.duration())
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn detached(mut self) -> Self {
        self.detach = true;
        self
    }

    /// Continuous background load, ended only by `stop`
    pub fn continuous(mut self) -> Self {
        self.detach = true;
        self.until_stopped = true;
        self
    }
}

impl Default for LockRequest {
    fn default() -> Self {
        Self {
            duration_ms: 1000,
            workers: 4,
            mode: ContentionMode::MemoryBus,
            seed: 0,
            detach: false,
            until_stopped: false,
        }
    }
}

/// Outcome of a lock call that reached the generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// Blocking lock ran to completion
    Completed,
    /// Detached lock started in the background
    Started,
    /// Detached lock refused because one is already running
    AlreadyActive,
    /// A running detached lock was asked to stop
    Stopped,
    /// Stop requested while no detached lock was running
    NotActive,
}

/// Acknowledgement returned by `lock`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockAck {
    pub status: LockStatus,

    /// Instance that took the lock
    #[serde(default)]
    pub stable_id: Option<String>,

    /// Time the generator actually ran (0 for detached starts)
    #[serde(default)]
    pub elapsed_ms: u64,
}

/// Response of `probe`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    /// Aggregate reported by the instance itself
    pub metric: f64,

    /// Raw per-repetition reload latencies
    pub samples: Vec<u64>,

    pub hardware_signature: HardwareSignature,

    /// Instance that served the probe
    #[serde(default)]
    pub stable_id: Option<String>,
}

/// Response of `identity`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub stable_id: String,
}

/// Remote control of one instance (or of whichever instance a shared
/// endpoint routes to)
#[async_trait]
pub trait InstanceControl: Send + Sync {
    /// Run the contention generator
    async fn lock(&self, request: &LockRequest) -> Result<LockAck>;

    /// Run one timing probe batch of `repetitions` reloads
    async fn probe(&self, repetitions: usize) -> Result<ProbeReport>;

    /// Return the stable identity of the serving instance
    async fn identity(&self) -> Result<Identity>;

    /// Stop the detached lock running on the serving instance, if any
    async fn stop(&self) -> Result<LockAck>;
}

/// An uncontrolled endpoint whose latency can be timed
#[async_trait]
pub trait VictimTarget: Send + Sync {
    /// Issue one request and return its round-trip time
    async fn request(&self) -> Result<Duration>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_mode_parse() {
        assert_eq!("llc".parse::<ContentionMode>().unwrap(), ContentionMode::Llc);
        assert_eq!(
            "memory-bus".parse::<ContentionMode>().unwrap(),
            ContentionMode::MemoryBus
        );
        assert!("nic".parse::<ContentionMode>().is_err());
        assert_eq!(ContentionMode::Llc.to_string(), "llc");
    }

    #[test]
    fn test_lock_request_defaults() {
        let request: LockRequest = serde_json::from_str(r#"{"duration_ms": 250}"#).unwrap();
        assert_eq!(request.duration(), Duration::from_millis(250));
        assert_eq!(request.workers, 4);
        assert!(!request.detach);

        let request = request.with_seed(9).detached();
        assert_eq!(request.seed, 9);
        assert!(request.detach);
        assert!(!request.until_stopped);
    }

    #[test]
    fn test_continuous_request_has_no_deadline() {
        let now = std::time::Instant::now();
        let bounded = LockRequest::default();
        assert_eq!(bounded.deadline(now), Some(now + Duration::from_millis(1000)));

        let continuous = LockRequest::default().continuous();
        assert!(continuous.detach);
        assert_eq!(continuous.deadline(now), None);

        let parsed: LockRequest =
            serde_json::from_str(r#"{"detach": true, "until_stopped": true}"#).unwrap();
        assert_eq!(parsed, continuous);
    }

    #[test]
    fn test_wire_shapes() {
        let ack: LockAck = serde_json::from_str(r#"{"status":"already_active"}"#).unwrap();
        assert_eq!(ack.status, LockStatus::AlreadyActive);
        let ack: LockAck = serde_json::from_str(r#"{"status":"not_active"}"#).unwrap();
        assert_eq!(ack.status, LockStatus::NotActive);
        assert_eq!(ack.stable_id, None);

        let report: ProbeReport = serde_json::from_str(
            r#"{"metric":120.5,"samples":[120,121],"hardware_signature":{"cpu_brand":"Xeon"}}"#,
        )
        .unwrap();
        assert_eq!(report.samples.len(), 2);
        assert_eq!(report.hardware_signature.frequency_hz, None);
    }
}
