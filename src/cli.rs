//! CLI argument parsing for the `triage` demo binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "triage")]
#[command(version)]
#[command(about = "Trace analysis engine: critical path, SRE patterns, comparison", long_about = None)]
pub struct Cli {
    /// Directory of one-JSON-trace-per-file fixtures to read from.
    #[arg(long, global = true, default_value = "fixtures")]
    pub fixtures: PathBuf,

    /// Optional TOML file overriding the engine's default options.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run quality validation, span durations, errors, critical path (and
    /// optionally an anomaly check against a baseline trace).
    Analyze {
        project: String,
        trace_id: String,
        #[arg(long)]
        baseline: Option<String>,
    },
    /// Run the SRE anti-pattern detectors (retry storm, cascading timeout,
    /// connection pool exhaustion).
    Patterns { project: String, trace_id: String },
    /// Diff timing and structure between a baseline and target trace.
    Compare {
        project: String,
        baseline_id: String,
        target_id: String,
        #[arg(long)]
        causal: bool,
    },
    /// List recent traces and pick out a representative baseline and
    /// anomaly example.
    FindExamples {
        project: String,
        #[arg(default_value = "")]
        filter: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_analyze_with_baseline() {
        let cli = Cli::parse_from([
            "triage", "analyze", "proj", "trace-1", "--baseline", "trace-0",
        ]);
        match cli.command {
            Command::Analyze {
                project,
                trace_id,
                baseline,
            } => {
                assert_eq!(project, "proj");
                assert_eq!(trace_id, "trace-1");
                assert_eq!(baseline.as_deref(), Some("trace-0"));
            }
            _ => panic!("expected Analyze"),
        }
    }

    #[test]
    fn parses_compare_with_causal_flag() {
        let cli = Cli::parse_from(["triage", "compare", "proj", "base", "target", "--causal"]);
        match cli.command {
            Command::Compare { causal, .. } => assert!(causal),
            _ => panic!("expected Compare"),
        }
    }

    #[test]
    fn fixtures_defaults_when_not_given() {
        let cli = Cli::parse_from(["triage", "patterns", "proj", "trace-1"]);
        assert_eq!(cli.fixtures, PathBuf::from("fixtures"));
    }
}
