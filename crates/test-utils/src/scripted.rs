//! Agents with scripted behaviour that record what they saw.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketdag::agent::{AgentContext, AgentFailure, AgentUnit};
use marketdag::types::AgentName;
use serde_json::{json, Value};
use tokio::sync::Notify;

/// How a [`ScriptedAgent`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Succeed,
    /// Fail attempts `1..=n`, then succeed.
    FailFirst(u32),
    AlwaysFail,
    Panic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Started,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub agent: AgentName,
    pub attempt: u32,
    pub kind: EntryKind,
    /// Keys of the prior results visible to this attempt.
    pub seen_results: Vec<AgentName>,
    pub at: DateTime<Utc>,
}

/// Shared, ordered log of agent executions across a registry.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, entry: JournalEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Agent names in the order their attempts started (one per attempt).
    pub fn started(&self) -> Vec<AgentName> {
        self.entries()
            .into_iter()
            .filter(|e| e.kind == EntryKind::Started)
            .map(|e| e.agent)
            .collect()
    }

    pub fn attempts_of(&self, agent: &str) -> usize {
        self.started().iter().filter(|a| *a == agent).count()
    }
}

/// Hold an agent inside `execute` until the test releases it.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves once the gated agent has entered `execute`.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedAgent {
    name: AgentName,
    deps: Vec<AgentName>,
    retry_limit: u32,
    required_parameters: Vec<String>,
    behaviour: Behaviour,
    payload: Option<Value>,
    delay: Option<Duration>,
    progress: Vec<u8>,
    gate: Option<Gate>,
    journal: Journal,
}

impl ScriptedAgent {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            deps: Vec::new(),
            retry_limit: 0,
            required_parameters: Vec::new(),
            behaviour: Behaviour::Succeed,
            payload: None,
            delay: None,
            progress: Vec::new(),
            gate: None,
            journal: journal.clone(),
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.deps.extend(deps.iter().map(|d| d.to_string()));
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn requires(mut self, keys: &[&str]) -> Self {
        self.required_parameters = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn behaviour(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    /// Payload returned on success; defaults to `{"agent": <name>}`.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sub-progress percentages reported during each attempt.
    pub fn progress_steps(mut self, steps: &[u8]) -> Self {
        self.progress = steps.to_vec();
        self
    }

    pub fn gated(mut self, gate: &Gate) -> Self {
        self.gate = Some(gate.clone());
        self
    }

    fn entry(&self, ctx: &AgentContext, kind: EntryKind) -> JournalEntry {
        JournalEntry {
            agent: self.name.clone(),
            attempt: ctx.attempt(),
            kind,
            seen_results: ctx.prior_results().keys().cloned().collect(),
            at: Utc::now(),
        }
    }
}

#[async_trait]
impl AgentUnit for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[AgentName] {
        &self.deps
    }

    fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    fn required_parameters(&self) -> &[String] {
        &self.required_parameters
    }

    async fn execute(&self, ctx: AgentContext) -> Result<Value, AgentFailure> {
        self.journal.record(self.entry(&ctx, EntryKind::Started));

        if let Some(gate) = &self.gate {
            gate.started.notify_one();
            gate.release.notified().await;
        }
        for step in &self.progress {
            ctx.report_progress(*step, format!("{} at {step}%", self.name));
            tokio::task::yield_now().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let attempt = ctx.attempt();
        let outcome = match self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::FailFirst(n) if attempt <= n => Err(()),
            Behaviour::FailFirst(_) => Ok(()),
            Behaviour::AlwaysFail => Err(()),
            Behaviour::Panic => panic!("scripted panic in {}", self.name),
        };

        self.journal.record(self.entry(&ctx, EntryKind::Finished));
        match outcome {
            Ok(()) => Ok(self
                .payload
                .clone()
                .unwrap_or_else(|| json!({ "agent": self.name }))),
            Err(()) => Err(AgentFailure::new(format!(
                "scripted failure of {} on attempt {attempt}",
                self.name
            ))),
        }
    }
}
