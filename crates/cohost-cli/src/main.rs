//! cohost - operator CLI for co-residency inference

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cohost_core::{CandidateSets, CohostConfig, GroupingReport, InstanceControl, ObservabilityConfig};
use cohost_driver::HttpInstance;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

mod commands;
mod output;

use commands::localize::Candidates;
use output::{print_warning, OutputFormat, OutputFormatter};

/// Co-residency inference for cloud instances
#[derive(Debug, Parser)]
#[command(name = "cohost")]
#[command(about = "Co-residency inference for cloud instances")]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "COHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Also write the report as JSON to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Group addressable instances by physical host
    #[command(name = "group")]
    Group {
        /// Instance list (URL per line, or a YAML/JSON descriptor list)
        #[arg(short, long, value_name = "FILE")]
        instances: PathBuf,

        /// Probe metric threshold τ
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Skip the reverification round of each group
        #[arg(long)]
        no_reverify: bool,
    },

    /// Group instances reachable only through one load-balanced endpoint
    #[command(name = "group-scaled")]
    GroupScaled {
        /// Shared endpoint
        #[arg(short, long)]
        endpoint: Option<Url>,

        /// Known stable ids (comma-separated); discovered from the endpoint when omitted
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,

        /// File with one stable id per line
        #[arg(long, value_name = "FILE")]
        ids_file: Option<PathBuf>,

        /// Probe metric threshold τ
        #[arg(short, long)]
        threshold: Option<f64>,
    },

    /// Bucket instances into candidate sets by hardware signature
    #[command(name = "prepare-sets")]
    PrepareSets {
        /// Instance list
        #[arg(short, long, value_name = "FILE")]
        instances: PathBuf,

        /// Grouping report of an earlier `group` run
        #[arg(short, long, value_name = "FILE")]
        groups: Option<PathBuf>,
    },

    /// Find the candidate sharing a host with the victim
    #[command(name = "localize")]
    Localize {
        /// Instance list searched as one pool
        #[arg(short, long, value_name = "FILE", required_unless_present = "sets")]
        instances: Option<PathBuf>,

        /// Candidate sets written by `prepare-sets`, screened before bisection
        #[arg(long, value_name = "FILE", conflicts_with = "instances")]
        sets: Option<PathBuf>,

        /// Victim URL
        #[arg(short, long)]
        victim: Option<Url>,

        /// Victim latency threshold θ in milliseconds
        #[arg(short, long)]
        threshold: Option<f64>,
    },

    /// Probe instances without contention and report the distribution
    #[command(name = "baseline")]
    Baseline {
        /// Instance list
        #[arg(short, long, value_name = "FILE")]
        instances: PathBuf,

        /// Probe batches per instance
        #[arg(short, long, default_value = "10")]
        batches: usize,
    },

    /// Start or stop background contention on one agent
    #[command(name = "contend")]
    Contend {
        /// Agent URL
        #[arg(short, long)]
        instance: Url,

        /// Run for this long instead of until stopped
        #[arg(short, long, conflicts_with = "stop")]
        duration_ms: Option<u64>,

        /// Stop the contention running on the agent
        #[arg(long)]
        stop: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }
    apply_overrides(&mut config, &cli.command);
    init_logging(&config.observability);
    config.validate().context("Invalid configuration")?;

    let code = run(cli, config).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CohostConfig> {
    match path {
        Some(path) => CohostConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => CohostConfig::load().context("Failed to load configuration"),
    }
}

/// Fold command-line flags into the loaded configuration
fn apply_overrides(config: &mut CohostConfig, command: &Commands) {
    match command {
        Commands::Group {
            threshold,
            no_reverify,
            ..
        } => {
            if threshold.is_some() {
                config.grouping.threshold = *threshold;
            }
            if *no_reverify {
                config.grouping.reverify = false;
            }
        }
        Commands::GroupScaled {
            endpoint,
            threshold,
            ..
        } => {
            if threshold.is_some() {
                config.grouping.threshold = *threshold;
            }
            if endpoint.is_some() {
                config.scaled_out.endpoint = endpoint.clone();
            }
        }
        Commands::Localize {
            victim, threshold, ..
        } => {
            if threshold.is_some() {
                config.localization.threshold_ms = *threshold;
            }
            if victim.is_some() {
                config.localization.victim_url = victim.clone();
            }
        }
        Commands::PrepareSets { .. } | Commands::Baseline { .. } | Commands::Contend { .. } => {}
    }
}

/// Logs go to stderr so that JSON and YAML output stay parseable
fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "cohost={level},cohost_driver={level},cohost_core={level}",
            level = config.log_level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs() {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

/// Execute the subcommand; returns the process exit code
async fn run(cli: Cli, config: CohostConfig) -> Result<i32> {
    let formatter = OutputFormatter::new(cli.output);
    let report_path = cli.report.as_deref();
    debug!("Running {:?}", cli.command);

    match cli.command {
        Commands::Group { instances, .. } => {
            let (_, handles) = commands::connect(&config.driver, &instances)?;
            let report = commands::group::group_instances(&config, handles).await?;
            if !report.unreachable.is_empty() {
                print_warning(&format!(
                    "{} instances were unreachable and left out of every group",
                    report.unreachable.len()
                ));
            }
            formatter.emit(&report, report_path)?;
        }
        Commands::GroupScaled { ids, ids_file, .. } => {
            let endpoint = config
                .scaled_out
                .endpoint
                .clone()
                .context("No endpoint: pass --endpoint or set scaled_out.endpoint")?;
            let known = commands::group::known_ids(&ids, ids_file.as_deref())?;

            let control: Arc<dyn InstanceControl> =
                Arc::new(HttpInstance::new(endpoint, config.driver.request_timeout())?);
            let report = commands::group::group_scaled(&config, control, known).await?;
            formatter.emit(&report, report_path)?;
        }
        Commands::PrepareSets { instances, groups } => {
            let grouping: Option<GroupingReport> = groups
                .as_deref()
                .map(commands::read_report)
                .transpose()?;
            let (descriptors, handles) = commands::connect(&config.driver, &instances)?;
            let pairs = descriptors.into_iter().zip(handles).collect();

            let sets = commands::prepare::prepare_sets(&config, pairs, grouping.as_ref()).await;
            formatter.emit(&sets, report_path)?;
        }
        Commands::Localize {
            instances, sets, ..
        } => {
            let victim = commands::localize::http_victim(&config)?;
            let candidates = match (sets, instances) {
                (Some(path), _) => {
                    let sets: CandidateSets = commands::read_report(&path)?;
                    Candidates::from_sets(&config.driver, &sets)?
                }
                (None, Some(path)) => {
                    Candidates::Pool(commands::connect(&config.driver, &path)?.1)
                }
                (None, None) => anyhow::bail!("Pass --instances or --sets"),
            };

            let report = commands::localize::localize(&config, candidates, &victim).await?;
            formatter.emit(&report, report_path)?;
            return Ok(report.exit_code());
        }
        Commands::Baseline { instances, batches } => {
            let (_, handles) = commands::connect(&config.driver, &instances)?;
            let report = commands::baseline::baseline(&config, &handles, batches).await?;
            formatter.emit(&report, report_path)?;
        }
        Commands::Contend {
            instance,
            duration_ms,
            stop,
        } => {
            let control = HttpInstance::new(instance, config.driver.request_timeout())?;
            let ack = if stop {
                commands::contend::stop(&control).await?
            } else {
                commands::contend::start(&config, &control, duration_ms).await?
            };
            formatter.emit(&ack, report_path)?;
        }
    }

    Ok(0)
}
