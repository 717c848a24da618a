// src/lib.rs

pub mod agent;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod run;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{build_registry, load_and_validate, load_parameters};
use crate::dag::{AgentRegistry, ExecutionPlan};
use crate::engine::RunController;
use crate::run::{AgentResult, ProgressEvent, RunId, RunState, RunStatus};

/// How a CLI invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// `--dry-run`: the plan was printed, nothing executed.
    Planned,
    Finished(RunStatus),
}

impl RunOutcome {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            RunOutcome::Planned | RunOutcome::Finished(RunStatus::Completed)
        )
    }
}

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - workflow loading and registry construction
/// - parameter assembly
/// - one run on a [`RunController`], with progress printed as it happens
/// - Ctrl-C handling (stops the run)
pub async fn run(args: CliArgs) -> Result<RunOutcome> {
    let workflow = load_and_validate(&args.config)
        .with_context(|| format!("loading workflow {}", args.config.display()))?;
    let base_dir = config_root_dir(&args.config);
    let registry = Arc::new(build_registry(&workflow, &base_dir)?);

    if args.dry_run {
        print_dry_run(&registry, args.json)?;
        return Ok(RunOutcome::Planned);
    }

    let parameters = load_parameters(args.params.as_deref(), &args.set)
        .context("assembling run parameters")?;

    let controller = RunController::new(registry);
    let run_id = RunId::new();
    let mut events = controller.subscribe(&run_id);
    controller.start_with_id(run_id.clone(), parameters)?;
    info!(run_id = %run_id, "run started");

    let json_output = args.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event, json_output);
        }
    });

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let state = tokio::select! {
        res = controller.wait(&run_id) => res?,
        _ = ctrl_c => {
            warn!(run_id = %run_id, "Ctrl+C received, stopping run");
            controller.stop(&run_id)?;
            let _ = printer.await;
            return Err(anyhow!("run {run_id} stopped by user"));
        }
    };

    if let Err(e) = printer.await {
        debug!(error = %e, "event printer ended abnormally");
    }
    print_summary(&controller, &state, json_output)?;
    Ok(RunOutcome::Finished(state.status()))
}

/// Directory containing the workflow file, or `.`.
fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn print_dry_run(registry: &AgentRegistry, json_output: bool) -> Result<()> {
    let plan = ExecutionPlan::for_registry(registry);
    if json_output {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("marketdag dry-run");
        println!("{plan}");
    }
    debug!("dry-run complete (no execution)");
    Ok(())
}

fn print_event(event: &ProgressEvent, json_output: bool) {
    if json_output {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "could not serialise progress event"),
        }
    } else {
        println!("{event}");
    }
}

fn print_summary(controller: &RunController, state: &RunState, json_output: bool) -> Result<()> {
    if json_output {
        let summary = match controller.report(state.run_id()) {
            Ok(report) => serde_json::to_value(report)?,
            Err(_) => json!({
                "run_id": state.run_id(),
                "status": state.status(),
                "terminal_reason": state.terminal_reason(),
                "results": state.results(),
                "errors": state.errors(),
            }),
        };
        println!("{}", serde_json::to_string(&summary)?);
        return Ok(());
    }

    println!();
    println!("run {}: {}", state.run_id(), state.status());
    if let Some(reason) = state.terminal_reason() {
        println!("  reason: {reason}");
    }
    for name in state.completion_order() {
        match state.result(name) {
            Some(AgentResult::Completed {
                payload, attempts, ..
            }) => println!("  {name}: completed (attempts: {attempts}) {payload}"),
            Some(AgentResult::Skipped {
                reason, attempts, ..
            }) => println!("  {name}: skipped (attempts: {attempts}) {reason}"),
            None => {}
        }
    }
    if !state.errors().is_empty() {
        println!("  errors:");
        for e in state.errors() {
            let agent = e.agent.as_deref().unwrap_or("run");
            println!("    {agent} #{} {:?}: {}", e.attempt, e.kind, e.message);
        }
    }
    Ok(())
}
