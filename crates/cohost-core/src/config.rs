//! Configuration management for cohost
//!
//! Provides a unified configuration system that supports YAML files,
//! environment variables, and command-line argument overrides.

use crate::measurement::{Aggregate, ConfidencePolicy};
use crate::traits::{ContentionMode, LockRequest};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Main configuration structure for cohost components
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CohostConfig {
    /// Probe driver: timeouts, lock parameters, confidence rules
    pub driver: DriverConfig,

    /// Co-residency grouping
    pub grouping: GroupingConfig,

    /// Victim localization
    pub localization: LocalizationConfig,

    /// Grouping behind a shared load-balanced endpoint
    pub scaled_out: ScaledOutConfig,

    /// Instance agent
    pub agent: AgentConfig,

    /// Logging
    pub observability: ObservabilityConfig,
}

impl CohostConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file
    /// 3. Defaults (lowest)
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Ok(config_path) = std::env::var("COHOST_CONFIG") {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            for path in &["./cohost.yaml", "/etc/cohost/config.yaml"] {
                builder = builder.add_source(config::File::with_name(path).required(false));
            }
        }

        builder = builder.add_source(Self::environment());

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;

        parsed.validate()?;

        Ok(parsed)
    }

    /// Load configuration from a specific file, still honouring environment overrides
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path))
            .add_source(Self::environment());

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Parse a YAML document on top of the defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        let parsed: Self = serde_yaml::from_str(content)?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("COHOST")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.driver.validate()?;
        self.grouping.validate()?;
        self.localization.validate()?;
        self.scaled_out.validate()?;
        self.agent.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

/// Probe driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Timeout of a single remote call, lock calls get the lock duration on top
    pub request_timeout_ms: u64,

    /// Contention duration per round
    pub lock_duration_ms: u64,

    /// Worker count of the contention generator
    pub lock_workers: usize,

    pub contention_mode: ContentionMode,

    /// Base seed for lock requests; each round derives its own
    pub lock_seed: u64,

    /// Use detached locks and bound the window by the requested duration
    pub detach_lock: bool,

    /// Delay between sending the lock and opening the window
    pub warmup_ms: u64,

    /// Pause after a detached window before the next round
    pub settle_ms: u64,

    /// Minimum batch size for a confident result
    pub min_samples: usize,

    /// Reloads requested from an instance per probe batch
    pub probe_repetitions: usize,

    /// Maximum coefficient of variation for a confident result
    pub max_cv: Option<f64>,

    pub aggregate: Aggregate,

    /// Follow-up rounds under the same lock for deferred instances
    pub max_round_retries: u32,

    /// A round aborts when the share of failed probe calls exceeds this
    pub abort_failure_ratio: f64,

    /// Failed calls tolerated before an instance is marked unreachable
    pub max_transport_failures: u32,
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lock_duration_ms == 0 {
            return Err(Error::config("Lock duration must be > 0"));
        }

        if self.lock_workers == 0 {
            return Err(Error::config("Lock worker count must be > 0"));
        }

        if self.warmup_ms >= self.lock_duration_ms {
            return Err(Error::config("Warmup must be shorter than the lock duration"));
        }

        if self.min_samples == 0 {
            return Err(Error::config("Minimum sample count must be > 0"));
        }

        if self.probe_repetitions < self.min_samples {
            return Err(Error::config(format!(
                "probe_repetitions ({}) must be at least min_samples ({})",
                self.probe_repetitions, self.min_samples
            )));
        }

        if let Some(max_cv) = self.max_cv {
            if !(max_cv > 0.0) {
                return Err(Error::config("max_cv must be positive"));
            }
        }

        if !(0.0..=1.0).contains(&self.abort_failure_ratio) {
            return Err(Error::config("abort_failure_ratio must be within [0, 1]"));
        }

        if self.max_transport_failures == 0 {
            return Err(Error::config("max_transport_failures must be > 0"));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Lock request for a round; `round` perturbs the seed
    pub fn lock_request(&self, round: u64) -> LockRequest {
        LockRequest {
            duration_ms: self.lock_duration_ms,
            workers: self.lock_workers,
            mode: self.contention_mode,
            seed: self.lock_seed.wrapping_add(round),
            detach: self.detach_lock,
            until_stopped: false,
        }
    }

    pub fn confidence_policy(&self) -> ConfidencePolicy {
        ConfidencePolicy {
            min_samples: self.min_samples,
            max_cv: self.max_cv,
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            lock_duration_ms: 1000,
            lock_workers: 4,
            contention_mode: ContentionMode::MemoryBus,
            lock_seed: 42,
            detach_lock: false,
            warmup_ms: 100,
            settle_ms: 50,
            min_samples: 100,
            probe_repetitions: 1000,
            max_cv: None,
            aggregate: Aggregate::Mean,
            max_round_retries: 2,
            abort_failure_ratio: 0.5,
            max_transport_failures: 3,
        }
    }
}

/// Co-residency grouping configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    /// Calibrated probe threshold τ; must be supplied by the operator
    pub threshold: Option<f64>,

    /// Re-probe co-resident candidates under a fresh window
    pub reverify: bool,
}

impl GroupingConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(threshold) = self.threshold {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(Error::config("Grouping threshold must be a non-negative number"));
            }
        }
        Ok(())
    }

    /// Threshold, or a configuration error if the operator did not calibrate one
    pub fn require_threshold(&self) -> Result<f64> {
        self.threshold
            .ok_or_else(|| Error::config("grouping.threshold is not set"))
    }
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            threshold: None,
            reverify: true,
        }
    }
}

/// Victim localization configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    /// Calibrated victim latency threshold θ in milliseconds
    pub threshold_ms: Option<f64>,

    /// Victim endpoint
    pub victim_url: Option<Url>,

    /// Timed victim requests per window
    pub victim_runs: usize,

    /// Successful victim requests required for a confident round
    pub min_victim_samples: usize,

    /// Timeout of one victim request
    pub victim_timeout_ms: u64,
}

impl LocalizationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.victim_runs == 0 {
            return Err(Error::config("victim_runs must be > 0"));
        }

        if self.min_victim_samples == 0 || self.min_victim_samples > self.victim_runs {
            return Err(Error::config("min_victim_samples must be within 1..=victim_runs"));
        }

        if let Some(threshold) = self.threshold_ms {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(Error::config("Localization threshold must be a non-negative number"));
            }
        }

        Ok(())
    }

    pub fn require_threshold(&self) -> Result<f64> {
        self.threshold_ms
            .ok_or_else(|| Error::config("localization.threshold_ms is not set"))
    }

    pub fn victim_timeout(&self) -> Duration {
        Duration::from_millis(self.victim_timeout_ms)
    }
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        Self {
            threshold_ms: None,
            victim_url: None,
            victim_runs: 5,
            min_victim_samples: 3,
            victim_timeout_ms: 30_000,
        }
    }
}

/// Scaled-out grouping configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaledOutConfig {
    /// Shared load-balanced endpoint
    pub endpoint: Option<Url>,

    /// Concurrent probes issued per round
    pub checks_per_round: usize,

    /// Lock attempts per group before giving up
    pub max_lock_attempts: u32,

    /// Concurrent identity calls per discovery wave
    pub discovery_calls: usize,

    /// Discovery ends after this many waves in a row find no new id
    pub discovery_quiet_waves: u32,

    /// Upper bound on discovery waves
    pub discovery_max_waves: u32,
}

impl ScaledOutConfig {
    pub fn validate(&self) -> Result<()> {
        if self.checks_per_round == 0 {
            return Err(Error::config("checks_per_round must be > 0"));
        }

        if self.max_lock_attempts == 0 {
            return Err(Error::config("max_lock_attempts must be > 0"));
        }

        if self.discovery_calls == 0 || self.discovery_quiet_waves == 0 {
            return Err(Error::config(
                "discovery_calls and discovery_quiet_waves must be > 0",
            ));
        }

        if self.discovery_max_waves < self.discovery_quiet_waves {
            return Err(Error::config(
                "discovery_max_waves must be at least discovery_quiet_waves",
            ));
        }

        Ok(())
    }
}

impl Default for ScaledOutConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            checks_per_round: 60,
            max_lock_attempts: 20,
            discovery_calls: 20,
            discovery_quiet_waves: 2,
            discovery_max_waves: 25,
        }
    }
}

/// Instance agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bind: SocketAddr,

    /// Shared read-only file backing the probed line; `None` maps anonymous memory
    pub probe_file: Option<PathBuf>,

    /// Byte offset of the probed line inside the mapping
    pub probe_offset: u64,

    /// Repetitions per probe batch
    pub probe_repetitions: usize,

    /// Counter slots in the misaligned region
    pub lock_slots: usize,

    /// Byte offset of the counters from a line boundary
    pub lock_misalignment: usize,

    /// Size of the LLC thrash buffer in MiB
    pub llc_buffer_mib: usize,

    /// Upper bound accepted for a lock duration
    pub max_lock_duration_ms: u64,

    /// Upper bound accepted for a worker count
    pub max_lock_workers: usize,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.probe_repetitions == 0 {
            return Err(Error::config("probe_repetitions must be > 0"));
        }

        if self.lock_slots == 0 {
            return Err(Error::config("lock_slots must be > 0"));
        }

        if self.lock_misalignment % 4 == 0 || self.lock_misalignment >= 64 {
            return Err(Error::config(
                "lock_misalignment must straddle a cache line (1..64, not a multiple of 4)",
            ));
        }

        if self.llc_buffer_mib == 0 {
            return Err(Error::config("llc_buffer_mib must be > 0"));
        }

        if self.max_lock_workers == 0 {
            return Err(Error::config("max_lock_workers must be > 0"));
        }

        Ok(())
    }

    pub fn max_lock_duration(&self) -> Duration {
        Duration::from_millis(self.max_lock_duration_ms)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            probe_file: Some(PathBuf::from("/usr/lib/x86_64-linux-gnu/libcrypto.so.3")),
            probe_offset: 0x16aa00,
            probe_repetitions: 1000,
            lock_slots: 64,
            lock_misalignment: 3,
            llc_buffer_mib: 64,
            max_lock_duration_ms: 120_000,
            max_lock_workers: 64,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,

    /// Log format (json or text)
    pub log_format: String,
}

impl ObservabilityConfig {
    pub fn validate(&self) -> Result<()> {
        match self.log_format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(Error::config(format!("Unknown log format '{}'", other))),
        }
    }

    pub fn json_logs(&self) -> bool {
        self.log_format == "json"
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = CohostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.driver.abort_failure_ratio, 0.5);
        assert_eq!(config.agent.probe_offset, 0x16aa00);
        assert!(config.grouping.reverify);
        assert!(config.grouping.require_threshold().is_err());
    }

    #[test]
    fn test_driver_helpers() {
        let driver = DriverConfig::default();
        assert_eq!(driver.lock_duration(), Duration::from_secs(1));
        assert_eq!(driver.warmup(), Duration::from_millis(100));

        let request = driver.lock_request(3);
        assert_eq!(request.seed, 45);
        assert_eq!(request.workers, 4);
        assert!(!request.detach);

        assert_eq!(driver.confidence_policy().min_samples, 100);
    }

    #[test]
    fn test_driver_validation() {
        let mut driver = DriverConfig::default();
        driver.warmup_ms = driver.lock_duration_ms;
        assert!(driver.validate().is_err());

        let mut driver = DriverConfig::default();
        driver.abort_failure_ratio = 1.5;
        assert!(driver.validate().is_err());

        let mut driver = DriverConfig::default();
        driver.max_cv = Some(0.0);
        assert!(driver.validate().is_err());

        let mut driver = DriverConfig::default();
        driver.probe_repetitions = driver.min_samples - 1;
        assert!(driver.validate().is_err());
        driver.probe_repetitions = driver.min_samples;
        assert!(driver.validate().is_ok());
    }

    #[test]
    fn test_scaled_out_validation() {
        assert!(ScaledOutConfig::default().validate().is_ok());

        let config = ScaledOutConfig {
            discovery_max_waves: 1,
            ..ScaledOutConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_misalignment_must_straddle() {
        let mut agent = AgentConfig::default();
        for bad in [0, 4, 8, 64] {
            agent.lock_misalignment = bad;
            assert!(agent.validate().is_err(), "misalignment {} accepted", bad);
        }
        for good in [1, 2, 3, 5] {
            agent.lock_misalignment = good;
            assert!(agent.validate().is_ok());
        }
    }

    #[test]
    fn test_localization_validation() {
        let mut localization = LocalizationConfig::default();
        localization.min_victim_samples = localization.victim_runs + 1;
        assert!(localization.validate().is_err());

        localization.min_victim_samples = 1;
        localization.threshold_ms = Some(f64::NAN);
        assert!(localization.validate().is_err());
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = CohostConfig::from_yaml(
            "grouping:\n  threshold: 250.0\ndriver:\n  lock_duration_ms: 2000\n",
        )
        .unwrap();
        assert_eq!(config.grouping.require_threshold().unwrap(), 250.0);
        assert_eq!(config.driver.lock_duration_ms, 2000);
        assert_eq!(config.driver.lock_workers, 4);
        assert_eq!(config.observability.log_format, "text");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "localization:\n  threshold_ms: 35.5\n  victim_runs: 7\nagent:\n  bind: 127.0.0.1:9000\n"
        )
        .unwrap();

        let config = CohostConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.localization.threshold_ms, Some(35.5));
        assert_eq!(config.localization.victim_runs, 7);
        assert_eq!(config.agent.bind, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.agent.lock_slots, 64);
    }

    #[test]
    fn test_invalid_log_format() {
        let mut config = CohostConfig::default();
        config.observability.log_format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
