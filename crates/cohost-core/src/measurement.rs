//! Probe measurements and their classification
//!
//! A raw probe batch is reduced to a [`ProbeResult`]; the result is compared
//! against a calibrated threshold to produce a [`Verdict`]. Batches that are
//! too small or too noisy never produce a definitive verdict.

use crate::InstanceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Statistic used to reduce a batch to one metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    #[default]
    Mean,
    Median,
}

impl std::fmt::Display for Aggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Aggregate::Mean => write!(f, "mean"),
            Aggregate::Median => write!(f, "median"),
        }
    }
}

impl std::str::FromStr for Aggregate {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mean" => Ok(Aggregate::Mean),
            "median" => Ok(Aggregate::Median),
            other => Err(crate::Error::config(format!("unknown aggregate '{}'", other))),
        }
    }
}

/// Descriptive statistics of a batch
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SampleStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub p95: f64,
    pub min: f64,
    pub max: f64,
}

impl SampleStats {
    /// Compute statistics; an empty batch yields all zeros
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        Self {
            count,
            mean,
            median: median_of_sorted(&sorted),
            std_dev: variance.sqrt(),
            p95: percentile_of_sorted(&sorted, 95.0),
            min: sorted[0],
            max: sorted[count - 1],
        }
    }

    /// Compute statistics over integer samples (cycles or nanoseconds)
    pub fn from_samples(samples: &[u64]) -> Self {
        let values: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        Self::from_values(&values)
    }

    /// Coefficient of variation; zero when the mean is zero
    pub fn coefficient_of_variation(&self) -> f64 {
        if self.mean > 0.0 {
            self.std_dev / self.mean
        } else {
            0.0
        }
    }

    /// Value of the chosen aggregate
    pub fn aggregate(&self, aggregate: Aggregate) -> f64 {
        match aggregate {
            Aggregate::Mean => self.mean,
            Aggregate::Median => self.median,
        }
    }
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Nearest-rank percentile of an ascending slice
fn percentile_of_sorted(sorted: &[f64], pct: f64) -> f64 {
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Median of an arbitrary slice, `None` when empty
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(median_of_sorted(&sorted))
}

/// Rules deciding whether a batch is stable enough to compare
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidencePolicy {
    /// Minimum number of samples
    pub min_samples: usize,

    /// Maximum coefficient of variation, if enforced
    pub max_cv: Option<f64>,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            min_samples: 100,
            max_cv: None,
        }
    }
}

/// Why a measurement cannot be trusted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum LowConfidence {
    TooFewSamples { got: usize, required: usize },
    HighVariance { cv: f64, max_cv: f64 },
    OutsideWindow,
    ProbeFailed { message: String },
}

impl std::fmt::Display for LowConfidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LowConfidence::TooFewSamples { got, required } => {
                write!(f, "batch of {} below minimum {}", got, required)
            }
            LowConfidence::HighVariance { cv, max_cv } => {
                write!(f, "coefficient of variation {:.3} above {:.3}", cv, max_cv)
            }
            LowConfidence::OutsideWindow => write!(f, "probe outside contention window"),
            LowConfidence::ProbeFailed { message } => write!(f, "probe failed: {}", message),
        }
    }
}

/// Aggregated probe batch for one instance within one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub instance_id: InstanceId,

    /// Aggregate compared against the threshold
    pub metric: f64,

    pub stats: SampleStats,

    /// `None` when confident
    pub low_confidence: Option<LowConfidence>,

    pub observed_at: DateTime<Utc>,
}

impl ProbeResult {
    /// Reduce raw samples to a result, applying the confidence policy
    pub fn from_samples(
        instance_id: InstanceId,
        samples: &[u64],
        aggregate: Aggregate,
        policy: &ConfidencePolicy,
    ) -> Self {
        let stats = SampleStats::from_samples(samples);

        let low_confidence = if stats.count < policy.min_samples {
            Some(LowConfidence::TooFewSamples {
                got: stats.count,
                required: policy.min_samples,
            })
        } else {
            policy.max_cv.and_then(|max_cv| {
                let cv = stats.coefficient_of_variation();
                (cv > max_cv).then_some(LowConfidence::HighVariance { cv, max_cv })
            })
        };

        Self {
            instance_id,
            metric: stats.aggregate(aggregate),
            stats,
            low_confidence,
            observed_at: Utc::now(),
        }
    }

    /// Result for a probe call that never returned data
    pub fn failed(instance_id: InstanceId, message: impl Into<String>) -> Self {
        Self {
            instance_id,
            metric: 0.0,
            stats: SampleStats::default(),
            low_confidence: Some(LowConfidence::ProbeFailed {
                message: message.into(),
            }),
            observed_at: Utc::now(),
        }
    }

    /// Downgrade a result whose probe interval was not inside the window
    pub fn outside_window(mut self) -> Self {
        self.low_confidence = Some(LowConfidence::OutsideWindow);
        self
    }

    pub fn is_confident(&self) -> bool {
        self.low_confidence.is_none()
    }

    /// Compare against a threshold; strict inequality
    pub fn classify(&self, threshold: f64) -> Verdict {
        match &self.low_confidence {
            Some(reason) => Verdict::Unknown(reason.clone()),
            None if exceeds(self.metric, threshold) => Verdict::CoResident,
            None => Verdict::NotCoResident,
        }
    }
}

/// Signal test shared by grouping and localization
pub fn exceeds(metric: f64, threshold: f64) -> bool {
    metric > threshold
}

/// Outcome of comparing one result against a threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    CoResident,
    NotCoResident,
    Unknown(LowConfidence),
}

impl Verdict {
    pub fn is_definitive(&self) -> bool {
        !matches!(self, Verdict::Unknown(_))
    }
}

/// Interval during which contention is known to be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentionWindow {
    pub start: Instant,
    pub end: Instant,
}

impl ContentionWindow {
    pub fn new(start: Instant, end: Instant) -> Self {
        Self { start, end }
    }

    /// True iff `[started, finished]` lies entirely inside the window
    pub fn contains(&self, started: Instant, finished: Instant) -> bool {
        started >= self.start && finished <= self.end && started <= finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(min_samples: usize) -> ConfidencePolicy {
        ConfidencePolicy {
            min_samples,
            max_cv: None,
        }
    }

    #[test]
    fn test_sample_stats() {
        let stats = SampleStats::from_samples(&[10, 20, 30, 40]);
        assert_eq!(stats.count, 4);
        assert_eq!(stats.mean, 25.0);
        assert_eq!(stats.median, 25.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 40.0);
        assert_eq!(stats.p95, 40.0);
        assert!((stats.std_dev - 11.180339887).abs() < 1e-6);

        let empty = SampleStats::from_samples(&[]);
        assert_eq!(empty.count, 0);
        assert_eq!(empty.coefficient_of_variation(), 0.0);
    }

    #[test]
    fn test_median_helper() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn test_aggregate_selection() {
        let samples = [100, 100, 100, 1000];
        let mean = ProbeResult::from_samples("a".into(), &samples, Aggregate::Mean, &policy(1));
        let med = ProbeResult::from_samples("a".into(), &samples, Aggregate::Median, &policy(1));
        assert_eq!(mean.metric, 325.0);
        assert_eq!(med.metric, 100.0);
        assert_eq!("median".parse::<Aggregate>().unwrap(), Aggregate::Median);
        assert!("mode".parse::<Aggregate>().is_err());
    }

    #[test]
    fn test_threshold_is_strict() {
        let result = ProbeResult::from_samples("a".into(), &[200, 200], Aggregate::Mean, &policy(2));
        assert_eq!(result.classify(200.0), Verdict::NotCoResident);
        assert_eq!(result.classify(199.9), Verdict::CoResident);
    }

    #[test]
    fn test_small_batch_is_never_definitive() {
        let result = ProbeResult::from_samples("a".into(), &[5000; 10], Aggregate::Mean, &policy(100));
        assert!(!result.is_confident());
        for threshold in [0.0, 100.0, 10_000.0] {
            let verdict = result.classify(threshold);
            assert!(!verdict.is_definitive());
            assert!(matches!(
                verdict,
                Verdict::Unknown(LowConfidence::TooFewSamples { got: 10, required: 100 })
            ));
        }
    }

    #[test]
    fn test_high_variance_is_low_confidence() {
        let noisy = ConfidencePolicy {
            min_samples: 2,
            max_cv: Some(0.1),
        };
        let result = ProbeResult::from_samples("a".into(), &[10, 1000], Aggregate::Mean, &noisy);
        assert!(matches!(
            result.low_confidence,
            Some(LowConfidence::HighVariance { .. })
        ));

        let steady = ProbeResult::from_samples("a".into(), &[100, 101], Aggregate::Mean, &noisy);
        assert!(steady.is_confident());
    }

    #[test]
    fn test_failed_and_outside_window() {
        let failed = ProbeResult::failed("a".into(), "connection refused");
        assert!(!failed.classify(0.0).is_definitive());

        let result = ProbeResult::from_samples("a".into(), &[500, 500], Aggregate::Mean, &policy(1))
            .outside_window();
        assert_eq!(
            result.classify(100.0),
            Verdict::Unknown(LowConfidence::OutsideWindow)
        );
    }

    #[test]
    fn test_contention_window() {
        let base = Instant::now();
        let window = ContentionWindow::new(base + Duration::from_millis(10), base + Duration::from_millis(100));

        assert!(window.contains(base + Duration::from_millis(10), base + Duration::from_millis(100)));
        assert!(window.contains(base + Duration::from_millis(20), base + Duration::from_millis(50)));
        assert!(!window.contains(base, base + Duration::from_millis(50)));
        assert!(!window.contains(base + Duration::from_millis(20), base + Duration::from_millis(101)));
    }
}
