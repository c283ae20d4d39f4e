//! # cohost-driver
//!
//! Probe driver for co-residency inference.
//!
//! This crate provides:
//! - Lock-and-probe rounds synchronized to a contention window
//! - Co-residency grouping of addressable instances
//! - Scaled-out grouping behind a single load-balanced endpoint
//! - Victim localization by bisection, with an optional set pre-screen
//! - Candidate set preparation and baseline measurement
//! - The HTTP transport for instance agents and victims

pub mod baseline;
pub mod error;
pub mod grouping;
pub mod localization;
pub mod prepare;
pub mod round;
pub mod scaled_out;
pub mod transport;

#[cfg(test)]
mod testing;

pub use baseline::measure_baseline;
pub use error::{DriverError, Result};
pub use grouping::CoResidencyGrouper;
pub use localization::VictimLocator;
pub use prepare::{prepare_candidate_sets, UNKNOWN_BUCKET};
pub use round::{InstanceHandle, LockOutcome, Observation, ProbeDriver, RoundReport, VictimRound};
pub use scaled_out::ScaledOutGrouper;
pub use transport::{connect_instances, HttpInstance, HttpVictim};
