use anyhow::Result;
use clap::Parser;

use triage_engine::cli::{Cli, Command};
use triage_engine::config::EngineOptions;
use triage_engine::model::{CancelToken, Credentials};
use triage_engine::orchestrator::Engine;
use triage_engine::source::FileSource;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Cli::parse();
    let options = match &args.config {
        Some(path) => EngineOptions::from_toml_file(path)?,
        None => EngineOptions::default(),
    };

    let source = FileSource::new(&args.fixtures);
    let engine = Engine::new(source, &options);
    let credentials = Credentials::anonymous();
    let cancel = CancelToken::new();

    let output = match args.command {
        Command::Analyze {
            project,
            trace_id,
            baseline,
        } => serde_json::to_string_pretty(&engine.analyze_trace(
            &project,
            &trace_id,
            baseline.as_deref(),
            &credentials,
            &cancel,
            &options,
        ))?,
        Command::Patterns { project, trace_id } => serde_json::to_string_pretty(
            &engine.run_sre_patterns(&project, &trace_id, &credentials, &cancel, &options),
        )?,
        Command::Compare {
            project,
            baseline_id,
            target_id,
            causal,
        } => serde_json::to_string_pretty(&engine.compare(
            &project,
            &baseline_id,
            &target_id,
            causal,
            &credentials,
            &cancel,
        ))?,
        Command::FindExamples { project, filter } => serde_json::to_string_pretty(
            &engine.find_example_traces(&project, &filter, &credentials, &cancel, &options),
        )?,
    };

    println!("{output}");
    Ok(())
}
