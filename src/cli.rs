// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `marketdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "marketdag",
    version,
    about = "Run a market-research agent workflow with dependency ordering, retries and progress.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the workflow file (TOML).
    ///
    /// Default: `Marketdag.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Marketdag.toml")]
    pub config: PathBuf,

    /// JSON file holding the run parameters (a JSON object).
    #[arg(long, value_name = "FILE")]
    pub params: Option<PathBuf>,

    /// Set a single run parameter. Values are parsed as JSON when possible
    /// and kept as strings otherwise. Repeatable; applied after `--params`.
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub set: Vec<(String, String)>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `MARKETDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Print progress events and the final report as JSON lines.
    #[arg(long)]
    pub json: bool,

    /// Parse + validate, print the execution plan, but don't run any agent.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
