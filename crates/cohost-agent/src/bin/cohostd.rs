//! Main binary for the instance agent daemon (cohostd)

use anyhow::Context;
use clap::Parser;
use cohost_agent::{init_logging, serve, InstanceAgent};
use cohost_core::CohostConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "cohostd")]
#[command(about = "Instance agent exposing lock, probe and identity over HTTP")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "COHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    /// File whose mapping hosts the probed cache line
    #[arg(long, value_name = "FILE")]
    probe_file: Option<PathBuf>,

    /// Byte offset of the probed line inside the probe file
    #[arg(long, value_name = "OFFSET", value_parser = parse_offset)]
    probe_offset: Option<u64>,

    /// Probe an anonymous mapping instead of a file
    #[arg(long, conflicts_with = "probe_file")]
    anonymous_probe: bool,

    /// Log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn parse_offset(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid offset '{}': {}", value, e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CohostConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => CohostConfig::load().context("Failed to load configuration")?,
    };

    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(bind) = cli.bind {
        config.agent.bind = bind;
    }
    if let Some(path) = cli.probe_file {
        config.agent.probe_file = Some(path);
    }
    if cli.anonymous_probe {
        config.agent.probe_file = None;
    }
    if let Some(offset) = cli.probe_offset {
        config.agent.probe_offset = offset;
    }

    init_logging(&config.observability);
    config.validate().context("Invalid configuration")?;

    let agent = Arc::new(InstanceAgent::new(config.agent.clone())?);
    info!(
        "Starting cohostd {} on {}",
        env!("CARGO_PKG_VERSION"),
        config.agent.bind
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
    };

    serve(agent, config.agent.bind, shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert()
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("0x16aa00").unwrap(), 0x16aa00);
        assert_eq!(parse_offset("4096").unwrap(), 4096);
        assert!(parse_offset("0xzz").is_err());
    }

    #[test]
    fn test_overrides_parse() {
        let cli = Cli::try_parse_from([
            "cohostd",
            "--bind",
            "127.0.0.1:9000",
            "--probe-offset",
            "0x40",
            "--anonymous-probe",
        ])
        .unwrap();
        assert_eq!(cli.bind, Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(cli.probe_offset, Some(0x40));
        assert!(cli.anonymous_probe);
    }
}
