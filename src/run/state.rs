// src/run/state.rs

//! The mutable record of a single analysis run.
//!
//! `RunState` has exactly one writer: the [`crate::engine::Scheduler`] that
//! owns it. Everyone else sees clones. All mutators are `pub(crate)` and
//! become no-ops once the run reaches a terminal status.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::{MarketdagError, Result};
use crate::run::RunId;
use crate::types::AgentName;

/// Status of a run.
///
/// ```text
/// initializing -> running <-> paused
///                 running  -> completed
///                 running  -> error
/// initializing -> error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Initializing,
    Running,
    Paused,
    Completed,
    Error,
}

impl RunStatus {
    /// `completed` and `error` are terminal: no further agent executions occur.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error)
    }

    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: RunStatus) -> bool {
        matches!(
            (self, to),
            (RunStatus::Initializing, RunStatus::Running)
                | (RunStatus::Initializing, RunStatus::Error)
                | (RunStatus::Running, RunStatus::Paused)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Error)
                | (RunStatus::Paused, RunStatus::Running)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Initializing => "initializing",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// What is stored under an agent's name in [`RunState::results`].
///
/// `Skipped` is the tombstone left by a non-critical agent that exhausted its
/// retries. It satisfies dependencies like `Completed` does, but carries no
/// payload so dependents can tell the two apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentResult {
    Completed {
        payload: Value,
        attempts: u32,
        finished_at: DateTime<Utc>,
    },
    Skipped {
        reason: String,
        attempts: u32,
        finished_at: DateTime<Utc>,
    },
}

impl AgentResult {
    pub fn completed(payload: Value, attempts: u32) -> Self {
        AgentResult::Completed {
            payload,
            attempts,
            finished_at: Utc::now(),
        }
    }

    pub fn skipped(reason: impl Into<String>, attempts: u32) -> Self {
        AgentResult::Skipped {
            reason: reason.into(),
            attempts,
            finished_at: Utc::now(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, AgentResult::Skipped { .. })
    }

    /// The success payload, or `None` for a tombstone.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            AgentResult::Completed { payload, .. } => Some(payload),
            AgentResult::Skipped { .. } => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            AgentResult::Completed { attempts, .. } | AgentResult::Skipped { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        match self {
            AgentResult::Completed { finished_at, .. }
            | AgentResult::Skipped { finished_at, .. } => *finished_at,
        }
    }
}

/// Category of a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A single `execute` call failed (recoverable via retry).
    AgentExecution,
    /// An agent ran out of retries.
    RetryExhausted,
    /// The resolver found unfinished agents but nothing eligible.
    DependencyBlocked,
}

/// One entry of the append-only error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Agent the error belongs to; `None` for run-level errors.
    pub agent: Option<AgentName>,
    pub kind: ErrorKind,
    /// 1-based attempt number (0 for run-level errors).
    pub attempt: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn for_agent(agent: &str, kind: ErrorKind, attempt: u32, message: impl Into<String>) -> Self {
        Self {
            agent: Some(agent.to_string()),
            kind,
            attempt,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_run(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            agent: None,
            kind,
            attempt: 0,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The versioned record of a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    run_id: RunId,
    status: RunStatus,
    parameters: Value,
    results: BTreeMap<AgentName, AgentResult>,
    /// Keys of `results` in the order they were inserted.
    completion_order: Vec<AgentName>,
    errors: Vec<ErrorRecord>,
    retry_count: BTreeMap<AgentName, u32>,
    current_agent: Option<AgentName>,
    progress: u8,
    last_error: Option<String>,
    terminal_reason: Option<String>,
    /// Bumped on every mutation.
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RunState {
    /// Fresh run in `initializing` with empty results and errors.
    ///
    /// `retry_count` starts at zero for every agent in `agents`.
    pub(crate) fn new<'a>(
        run_id: RunId,
        parameters: Value,
        agents: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            status: RunStatus::Initializing,
            parameters,
            results: BTreeMap::new(),
            completion_order: Vec::new(),
            errors: Vec::new(),
            retry_count: agents.into_iter().map(|a| (a.to_string(), 0)).collect(),
            current_agent: None,
            progress: 0,
            last_error: None,
            terminal_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    pub fn results(&self) -> &BTreeMap<AgentName, AgentResult> {
        &self.results
    }

    pub fn result(&self, agent: &str) -> Option<&AgentResult> {
        self.results.get(agent)
    }

    pub fn has_result(&self, agent: &str) -> bool {
        self.results.contains_key(agent)
    }

    /// Payload of a successfully completed agent.
    pub fn payload(&self, agent: &str) -> Option<&Value> {
        self.results.get(agent).and_then(AgentResult::payload)
    }

    /// Agents in the order their results were recorded.
    pub fn completion_order(&self) -> &[AgentName] {
        &self.completion_order
    }

    /// Names of agents that were tombstoned.
    pub fn skipped(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_skipped())
            .map(|(name, _)| name.as_str())
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    /// Number of failed attempts recorded for `agent`.
    pub fn failures_of(&self, agent: &str) -> usize {
        self.errors
            .iter()
            .filter(|e| e.kind == ErrorKind::AgentExecution && e.agent.as_deref() == Some(agent))
            .count()
    }

    /// Retries granted so far to `agent`.
    pub fn retry_count(&self, agent: &str) -> u32 {
        self.retry_count.get(agent).copied().unwrap_or(0)
    }

    pub fn retry_counts(&self) -> &BTreeMap<AgentName, u32> {
        &self.retry_count
    }

    pub fn current_agent(&self) -> Option<&str> {
        self.current_agent.as_deref()
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Message of the most recent failure, cleared by the next success.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn terminal_reason(&self) -> Option<&str> {
        self.terminal_reason.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub(crate) fn transition(&mut self, to: RunStatus, command: &'static str) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(MarketdagError::InvalidTransition {
                run_id: self.run_id.clone(),
                from: self.status,
                command,
            });
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    pub(crate) fn set_current_agent(&mut self, agent: Option<&str>) {
        if self.frozen("set_current_agent") {
            return;
        }
        self.current_agent = agent.map(str::to_string);
        self.touch();
    }

    /// Record an agent's result. Returns `false` (and changes nothing) if the
    /// agent already has one.
    pub(crate) fn insert_result(&mut self, agent: &str, result: AgentResult) -> bool {
        if self.frozen("insert_result") {
            return false;
        }
        if self.results.contains_key(agent) {
            warn!(
                run_id = %self.run_id,
                agent = %agent,
                "refusing to overwrite an existing result"
            );
            return false;
        }
        self.results.insert(agent.to_string(), result);
        self.completion_order.push(agent.to_string());
        self.touch();
        true
    }

    pub(crate) fn push_error(&mut self, record: ErrorRecord) {
        if self.frozen("push_error") {
            return;
        }
        self.errors.push(record);
        self.touch();
    }

    /// Grant one more retry to `agent` and return the new count.
    pub(crate) fn grant_retry(&mut self, agent: &str) -> u32 {
        if self.frozen("grant_retry") {
            return self.retry_count(agent);
        }
        let count = self.retry_count.entry(agent.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        self.touch();
        count
    }

    /// Raise progress to `percent` (clamped to 100). Never lowers it.
    pub(crate) fn raise_progress(&mut self, percent: u8) {
        if self.frozen("raise_progress") {
            return;
        }
        let percent = percent.min(100);
        if percent > self.progress {
            self.progress = percent;
            self.touch();
        }
    }

    pub(crate) fn set_last_error(&mut self, message: Option<String>) {
        if self.frozen("set_last_error") {
            return;
        }
        self.last_error = message;
        self.touch();
    }

    pub(crate) fn set_terminal_reason(&mut self, reason: impl Into<String>) {
        if self.frozen("set_terminal_reason") {
            return;
        }
        self.terminal_reason = Some(reason.into());
        self.touch();
    }

    fn frozen(&self, op: &str) -> bool {
        if self.status.is_terminal() {
            warn!(run_id = %self.run_id, op, "run is terminal; ignoring mutation");
            true
        } else {
            false
        }
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> RunState {
        RunState::new(RunId::from("r1"), json!({}), ["product", "place"])
    }

    #[test]
    fn status_machine_allows_only_declared_edges() {
        use RunStatus::*;
        assert!(Initializing.can_transition_to(Running));
        assert!(Initializing.can_transition_to(Error));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Error));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Error.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Initializing.can_transition_to(Paused));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn invalid_transition_leaves_state_untouched() {
        let mut s = state();
        let before = s.clone();
        let err = s.transition(RunStatus::Paused, "pause").unwrap_err();
        assert!(matches!(
            err,
            MarketdagError::InvalidTransition {
                from: RunStatus::Initializing,
                ..
            }
        ));
        assert_eq!(s, before);
    }

    #[test]
    fn results_are_append_only() {
        let mut s = state();
        s.transition(RunStatus::Running, "start").unwrap();
        assert!(s.insert_result("product", AgentResult::completed(json!(1), 1)));
        assert!(!s.insert_result("product", AgentResult::completed(json!(2), 1)));
        assert_eq!(s.payload("product"), Some(&json!(1)));
        assert_eq!(s.completion_order(), ["product".to_string()]);
    }

    #[test]
    fn terminal_state_is_frozen() {
        let mut s = state();
        s.transition(RunStatus::Running, "start").unwrap();
        s.transition(RunStatus::Completed, "complete").unwrap();
        let version = s.version();

        assert!(!s.insert_result("place", AgentResult::completed(json!(null), 1)));
        s.raise_progress(50);
        s.grant_retry("place");
        s.push_error(ErrorRecord::for_run(ErrorKind::DependencyBlocked, "x"));

        assert_eq!(s.version(), version);
        assert!(s.errors().is_empty());
        assert_eq!(s.retry_count("place"), 0);
    }

    #[test]
    fn progress_never_decreases() {
        let mut s = state();
        s.transition(RunStatus::Running, "start").unwrap();
        s.raise_progress(40);
        s.raise_progress(20);
        assert_eq!(s.progress(), 40);
        s.raise_progress(250);
        assert_eq!(s.progress(), 100);
    }

    #[test]
    fn tombstone_is_present_but_has_no_payload() {
        let mut s = state();
        s.transition(RunStatus::Running, "start").unwrap();
        s.insert_result("place", AgentResult::skipped("exhausted", 3));
        assert!(s.has_result("place"));
        assert_eq!(s.payload("place"), None);
        assert_eq!(s.skipped().collect::<Vec<_>>(), vec!["place"]);
    }
}
