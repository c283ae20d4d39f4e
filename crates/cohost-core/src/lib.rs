//! # cohost-core
//!
//! Core types, traits, and utilities for cohost - a co-residency inference
//! engine for cloud instances.
//!
//! This crate provides the data structures and interfaces shared by the
//! instance agent, the probe driver and the simulation harness:
//!
//! - Instance descriptors, hardware signatures and groups
//! - Probe results, confidence rules and threshold classification
//! - The `InstanceControl` / `VictimTarget` capability traits
//! - Configuration schema and loading
//! - Error handling types and run reports

pub mod config;
pub mod error;
pub mod measurement;
pub mod report;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{
    AgentConfig, CohostConfig, DriverConfig, GroupingConfig, LocalizationConfig,
    ObservabilityConfig, ScaledOutConfig,
};
pub use error::{Error, ErrorContext, Result};
pub use measurement::{
    exceeds, median, Aggregate, ConfidencePolicy, ContentionWindow, LowConfidence, ProbeResult,
    SampleStats, Verdict,
};
pub use report::{
    BaselineReport, CandidateSets, GroupingReport, InstanceBaseline, LocalizationOutcome,
    LocalizationReport, NotFoundReason,
};
pub use traits::{
    ContentionMode, Identity, InstanceControl, LockAck, LockRequest, LockStatus, ProbeReport,
    VictimTarget,
};
pub use types::{
    load_descriptors, parse_url_list, CandidateSet, Group, HardwareSignature, InstanceDescriptor,
    InstanceId,
};
