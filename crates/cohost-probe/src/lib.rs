//! # cohost-probe
//!
//! On-instance primitives for cohost: the contention generator, the
//! flush+reload timing probe and the hardware/identity descriptor.
//!
//! All raw memory, atomic and timing code lives in [`lowlevel`]; the other
//! modules are safe wrappers over it.

pub mod contention;
pub mod error;
pub mod identity;
pub mod lowlevel;
pub mod probe;

pub use contention::{ContentionConfig, ContentionGenerator, ContentionSummary};
pub use error::{ContentionError, ProbeError};
pub use identity::{cpu_brand, hardware_signature, stable_instance_id};
pub use probe::{ProbeBatch, ProbeTarget, TimingProbe};
