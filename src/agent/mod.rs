// src/agent/mod.rs

//! The agent contract consumed by the scheduler.
//!
//! An agent is an opaque unit of analysis work with a name, declared
//! dependencies and a retry limit. The scheduler never inspects the payload
//! an agent returns; it only records it.
//!
//! - [`command`] provides [`CommandAgent`], which runs a shell command.
//! - [`canned`] provides [`CannedAgent`], which returns a fixed payload.

pub mod canned;
pub mod command;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::run::{AgentResult, RunId};
use crate::types::AgentName;

pub use canned::CannedAgent;
pub use command::CommandAgent;

/// A pluggable unit of analysis work.
///
/// Implementations must be shareable across concurrently running runs; any
/// per-run state belongs in the returned payload, not in the agent.
#[async_trait]
pub trait AgentUnit: Send + Sync + fmt::Debug {
    /// Unique name within a registry.
    fn name(&self) -> &str;

    /// Names of agents whose results must be present before this one runs.
    fn dependencies(&self) -> &[AgentName];

    /// Retries allowed after the first failed attempt.
    fn retry_limit(&self) -> u32 {
        0
    }

    /// Advisory duration, used for planning only.
    fn estimated_duration(&self) -> Option<Duration> {
        None
    }

    /// Parameter keys this agent reads from the run parameters.
    fn required_parameters(&self) -> &[String] {
        &[]
    }

    /// Run the analysis.
    ///
    /// Implementations are responsible for their own timeouts: a hung
    /// `execute` hangs the run.
    async fn execute(&self, ctx: AgentContext) -> Result<Value, AgentFailure>;
}

/// Why an agent attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Execution,
    Timeout,
    Panicked,
}

/// Failure of a single `execute` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct AgentFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl AgentFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Execution,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("timed out after {}", crate::types::format_duration(after)),
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Panicked,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for AgentFailure {
    fn from(err: anyhow::Error) -> Self {
        AgentFailure::new(format!("{err:#}"))
    }
}

/// Sub-progress reported by a running agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubProgress {
    /// Progress within the agent, 0-100.
    pub percent: u8,
    pub message: String,
}

/// Handle an agent uses to report progress within a single attempt.
///
/// Reports are applied by the run's single writer, in order, while the agent
/// is still executing. Reporting after the attempt finished is harmless.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<SubProgress>>,
}

impl ProgressReporter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SubProgress>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A reporter that discards everything.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn report(&self, percent: u8, message: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(SubProgress {
                percent: percent.min(100),
                message: message.into(),
            });
        }
    }
}

/// Everything an agent may read during one attempt.
#[derive(Debug, Clone)]
pub struct AgentContext {
    run_id: RunId,
    agent: AgentName,
    attempt: u32,
    parameters: Arc<Value>,
    results: Arc<BTreeMap<AgentName, AgentResult>>,
    progress: ProgressReporter,
}

impl AgentContext {
    pub fn new(
        run_id: RunId,
        agent: impl Into<AgentName>,
        attempt: u32,
        parameters: Arc<Value>,
        results: Arc<BTreeMap<AgentName, AgentResult>>,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            run_id,
            agent: agent.into(),
            attempt,
            parameters,
            results,
            progress,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// 1-based attempt number for this agent in this run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// Results of every agent that finished before this attempt started,
    /// tombstones included.
    pub fn prior_results(&self) -> &BTreeMap<AgentName, AgentResult> {
        &self.results
    }

    /// Payload of a completed prior agent; `None` if missing or skipped.
    pub fn prior_payload(&self, agent: &str) -> Option<&Value> {
        self.results.get(agent).and_then(AgentResult::payload)
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn report_progress(&self, percent: u8, message: impl Into<String>) {
        self.progress.report(percent, message);
    }
}
