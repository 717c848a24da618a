// src/errors.rs

//! Crate-wide error type and result alias.
//!
//! Agent execution failures are deliberately absent here: they are absorbed
//! by the scheduler and recorded on the run (see [`crate::agent::AgentFailure`]
//! and [`crate::run::ErrorRecord`]). Everything in this enum is surfaced
//! synchronously to the caller that triggered it.

use thiserror::Error;

use crate::run::{RunId, RunStatus};

#[derive(Error, Debug)]
pub enum MarketdagError {
    /// Parameters cannot start any agent; the run never begins.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A controller command is not permitted from the run's current status.
    #[error("Invalid transition for run {run_id}: cannot {command} while {from}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        command: &'static str,
    },

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run {run_id} has not completed (status: {status})")]
    RunNotCompleted { run_id: RunId, status: RunStatus },

    #[error("Duplicate agent name: {0}")]
    DuplicateAgent(String),

    #[error("Agent '{agent}' has unknown dependency '{dependency}'")]
    UnknownDependency { agent: String, dependency: String },

    #[error("Agent '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Cycle detected in agent DAG: {0}")]
    DagCycle(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, MarketdagError>;
