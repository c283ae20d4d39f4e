//! # cohost-agent
//!
//! Instance agent for cohost.
//!
//! Runs on every attacker instance and exposes the contention generator,
//! the timing probe and the instance identity over HTTP:
//!
//! - `GET /lock` runs the contention generator (blocking or detached)
//! - `GET /probe` returns one flush+reload batch
//! - `GET /identity` and `GET /info` describe the instance
//! - `GET /health` and `GET /metrics` for operations

pub mod agent;
pub mod error;
pub mod metrics;
pub mod server;

pub use agent::{InstanceAgent, MAX_PROBE_REPETITIONS};
pub use error::{AgentError, Result};
pub use metrics::AgentMetrics;
pub use server::{create_router, serve};

use cohost_core::ObservabilityConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "cohost_agent={level},cohost_probe={level},tower_http=info",
            level = config.log_level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs() {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
