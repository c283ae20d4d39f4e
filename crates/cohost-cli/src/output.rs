//! Output formatting for the cohost CLI

use anyhow::{Context, Result};
use clap::ValueEnum;
use cohost_core::{
    BaselineReport, CandidateSets, GroupingReport, InstanceId, LocalizationOutcome,
    LocalizationReport, LockAck, LockStatus, SampleStats,
};
use colored::*;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use serde::Serialize;
use std::path::Path;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary and table
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Reports that can be shown as a summary plus a table
pub trait Formattable {
    fn table_headers(&self) -> Vec<&'static str>;
    fn table_rows(&self) -> Vec<Vec<String>>;

    /// Key-value lines shown above the table
    fn summary(&self) -> Vec<(&'static str, String)>;
}

/// Output formatter
pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print a report and, when `path` is given, persist it as JSON
    pub fn emit<T>(&self, report: &T, path: Option<&Path>) -> Result<()>
    where
        T: Serialize + Formattable,
    {
        println!("{}", self.render(report)?);
        if let Some(path) = path {
            write_report(path, report)?;
            if self.format == OutputFormat::Table {
                println!(
                    "{} {}",
                    "✓".green().bold(),
                    format!("Report written to {}", path.display()).green()
                );
            }
        }
        Ok(())
    }

    /// Render a report in the configured format
    pub fn render<T>(&self, report: &T) -> Result<String>
    where
        T: Serialize + Formattable,
    {
        match self.format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
            OutputFormat::Yaml => Ok(serde_yaml::to_string(report)?),
            OutputFormat::Table => {
                let mut lines: Vec<String> = report
                    .summary()
                    .into_iter()
                    .map(|(key, value)| format!("{}: {}", key.bold().cyan(), value))
                    .collect();

                let rows = report.table_rows();
                if !rows.is_empty() {
                    lines.push(String::new());
                    lines.push(build_table(&report.table_headers(), rows).to_string());
                }
                Ok(lines.join("\n"))
            }
        }
    }
}

fn build_table(headers: &[&str], rows: Vec<Vec<String>>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );
    for row in rows {
        table.add_row(row);
    }
    table
}

/// Write a report as pretty-printed JSON
pub fn write_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write report to {}", path.display()))
}

/// Print a warning on stderr
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "⚠".yellow().bold(), message.yellow());
}

fn join_ids(ids: &[InstanceId]) -> String {
    if ids.is_empty() {
        "-".to_string()
    } else {
        ids.iter().map(InstanceId::as_str).collect::<Vec<_>>().join(", ")
    }
}

fn format_ms(value: f64) -> String {
    format!("{:.2} ms", value)
}

fn stats_row(label: String, stats: &SampleStats) -> Vec<String> {
    vec![
        label,
        stats.count.to_string(),
        format!("{:.1}", stats.mean),
        format!("{:.1}", stats.median),
        format!("{:.1}", stats.p95),
        format!("{:.1}", stats.max),
    ]
}

impl Formattable for GroupingReport {
    fn table_headers(&self) -> Vec<&'static str> {
        vec!["Group", "Lock", "Size", "Members"]
    }

    fn table_rows(&self) -> Vec<Vec<String>> {
        self.groups
            .iter()
            .enumerate()
            .map(|(i, group)| {
                vec![
                    i.to_string(),
                    group.lock.to_string(),
                    group.len().to_string(),
                    join_ids(&group.members),
                ]
            })
            .collect()
    }

    fn summary(&self) -> Vec<(&'static str, String)> {
        let mut lines = vec![
            ("Threshold", format!("{}", self.threshold)),
            ("Groups", self.groups.len().to_string()),
            ("Grouped instances", self.grouped_count().to_string()),
            ("Unreachable", join_ids(&self.unreachable)),
        ];
        if !self.unresolved.is_empty() {
            lines.push(("Unresolved", join_ids(&self.unresolved)));
        }
        lines.push(("Rounds", self.rounds.to_string()));
        lines.push(("Aborted rounds", self.aborted_rounds.to_string()));
        lines
    }
}

impl Formattable for LockAck {
    fn table_headers(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn table_rows(&self) -> Vec<Vec<String>> {
        Vec::new()
    }

    fn summary(&self) -> Vec<(&'static str, String)> {
        let status = match self.status {
            LockStatus::Completed => "completed".green(),
            LockStatus::Started => "started".green(),
            LockStatus::Stopped => "stopped".green(),
            LockStatus::AlreadyActive => "already active".yellow(),
            LockStatus::NotActive => "not active".yellow(),
        };
        vec![
            ("Status", status.to_string()),
            ("Instance", self.stable_id.clone().unwrap_or_else(|| "-".to_string())),
        ]
    }
}

impl Formattable for CandidateSets {
    fn table_headers(&self) -> Vec<&'static str> {
        vec!["Set", "Signature", "Size", "Candidates"]
    }

    fn table_rows(&self) -> Vec<Vec<String>> {
        self.sets
            .iter()
            .enumerate()
            .map(|(i, set)| {
                vec![
                    i.to_string(),
                    set.signature.to_string(),
                    set.instances.len().to_string(),
                    join_ids(&set.instances),
                ]
            })
            .collect()
    }

    fn summary(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Sets", self.sets.len().to_string()),
            ("Candidates", self.total_candidates().to_string()),
        ]
    }
}

impl Formattable for LocalizationReport {
    fn table_headers(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn table_rows(&self) -> Vec<Vec<String>> {
        Vec::new()
    }

    fn summary(&self) -> Vec<(&'static str, String)> {
        let mut lines = vec![("Threshold", format_ms(self.threshold_ms))];
        match &self.outcome {
            LocalizationOutcome::Found {
                instance,
                latency_ms,
            } => {
                lines.push(("Outcome", "found".green().bold().to_string()));
                lines.push(("Instance", instance.to_string()));
                lines.push(("Victim latency", format_ms(*latency_ms)));
            }
            LocalizationOutcome::NotFound(reason) => {
                lines.push(("Outcome", "not found".red().bold().to_string()));
                lines.push(("Reason", reason.to_string()));
            }
        }
        if let Some(set) = self.searched_set {
            lines.push(("Searched set", set.to_string()));
        }
        if self.screen_rounds > 0 {
            lines.push(("Screen rounds", self.screen_rounds.to_string()));
        }
        lines.push(("Rounds", self.rounds.to_string()));
        lines.push(("Retried rounds", self.retried_rounds.to_string()));
        lines.push(("Unreachable", join_ids(&self.unreachable)));
        lines
    }
}

impl Formattable for BaselineReport {
    fn table_headers(&self) -> Vec<&'static str> {
        vec!["Instance", "Samples", "Mean", "Median", "P95", "Max"]
    }

    fn table_rows(&self) -> Vec<Vec<String>> {
        let mut rows: Vec<Vec<String>> = self
            .instances
            .iter()
            .map(|baseline| stats_row(baseline.instance_id.to_string(), &baseline.stats))
            .collect();
        if !rows.is_empty() {
            rows.push(stats_row("(pooled)".to_string(), &self.pooled));
        }
        rows
    }

    fn summary(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Instances", self.instances.len().to_string()),
            ("Unreachable", join_ids(&self.unreachable)),
        ]
    }
}
