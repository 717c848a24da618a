// src/engine/scheduler.rs

//! Pure scheduling core for a single run.
//!
//! The [`Scheduler`] owns the run's [`RunState`] and is its only writer. It
//! performs no IO: the async [`crate::engine::Runtime`] asks it what to do
//! next via [`Scheduler::step`], executes the agent, and feeds the outcome
//! back with [`Scheduler::record_success`] / [`Scheduler::record_failure`].
//! Every mutation yields the [`ProgressEvent`]s that describe it, numbered
//! from 1 without gaps.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::agent::AgentFailure;
use crate::dag::{AgentRegistry, BlockedAgent, DependencyResolver, Resolution};
use crate::errors::{MarketdagError, Result};
use crate::run::{
    AgentResult, ErrorKind, ErrorRecord, Phase, ProgressEvent, RunId, RunState, RunStatus,
};
use crate::types::AgentName;

/// What the runtime should do after a [`Scheduler::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// Execute `agent`; `attempt` is 1-based.
    Execute { agent: AgentName, attempt: u32 },
    /// Nothing to do until the run is resumed.
    Idle,
    /// The run reached a terminal status.
    Finished(RunStatus),
}

/// Result of a single scheduler iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStep {
    pub command: SchedulerCommand,
    pub events: Vec<ProgressEvent>,
}

#[derive(Debug, Clone)]
struct InFlight {
    agent: AgentName,
    attempt: u32,
}

#[derive(Debug)]
pub struct Scheduler {
    registry: Arc<AgentRegistry>,
    state: RunState,
    sequence: u64,
    in_flight: Option<InFlight>,
    executions: u64,
}

impl Scheduler {
    /// A scheduler for a fresh run in `initializing`.
    ///
    /// `null` parameters are treated as an empty object.
    pub fn new(registry: Arc<AgentRegistry>, run_id: RunId, parameters: Value) -> Self {
        let parameters = if parameters.is_null() {
            json!({})
        } else {
            parameters
        };
        let state = RunState::new(run_id, parameters, registry.names());
        Self {
            registry,
            state,
            sequence: 0,
            in_flight: None,
            executions: 0,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn into_state(self) -> RunState {
        self.state
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Agent executions started so far.
    pub fn executions(&self) -> u64 {
        self.executions
    }

    /// Maximum number of agent executions this run can perform.
    pub fn iteration_bound(&self) -> u64 {
        self.registry.execution_bound()
    }

    /// Validate parameters and move `initializing -> running`.
    ///
    /// On validation failure the run moves to `error` and never executes an
    /// agent.
    pub fn begin(&mut self) -> Result<Vec<ProgressEvent>> {
        if self.state.status() != RunStatus::Initializing {
            return Err(MarketdagError::InvalidTransition {
                run_id: self.state.run_id().clone(),
                from: self.state.status(),
                command: "start",
            });
        }

        if let Err(reason) = self.validate_parameters() {
            warn!(run_id = %self.state.run_id(), %reason, "run parameters rejected");
            self.state.set_terminal_reason(reason.clone());
            self.state.transition(RunStatus::Error, "start")?;
            return Err(MarketdagError::Validation(reason));
        }

        self.state.transition(RunStatus::Running, "start")?;
        info!(
            run_id = %self.state.run_id(),
            agents = self.registry.len(),
            "run started"
        );
        let message = format!("run started with {} agents", self.registry.len());
        Ok(vec![self.event(None, Phase::Started, message)])
    }

    /// Decide what happens next. Call only when no agent is in flight.
    pub fn step(&mut self) -> SchedulerStep {
        let mut events = Vec::new();

        match self.state.status() {
            RunStatus::Paused => return self.command(SchedulerCommand::Idle, events),
            status if status.is_terminal() => {
                return self.command(SchedulerCommand::Finished(status), events);
            }
            RunStatus::Initializing => {
                warn!(run_id = %self.state.run_id(), "step before begin; starting implicitly");
                match self.begin() {
                    Ok(started) => events.extend(started),
                    Err(_) => {
                        let status = self.state.status();
                        return self.command(SchedulerCommand::Finished(status), events);
                    }
                }
            }
            _ => {}
        }

        if let Some(in_flight) = &self.in_flight {
            warn!(
                run_id = %self.state.run_id(),
                agent = %in_flight.agent,
                "step called while an agent is in flight"
            );
            return self.command(SchedulerCommand::Idle, events);
        }

        let resolution = DependencyResolver::new(&self.registry).next_eligible(&self.state);
        let command = match resolution {
            Resolution::Run(agent) => {
                let attempt = self.state.retry_count(&agent) + 1;
                self.state.set_current_agent(Some(agent.as_str()));
                self.in_flight = Some(InFlight {
                    agent: agent.clone(),
                    attempt,
                });
                self.executions += 1;
                debug!(
                    run_id = %self.state.run_id(),
                    agent = %agent,
                    attempt,
                    "agent selected"
                );
                events.push(self.event(
                    Some(agent.as_str()),
                    Phase::Started,
                    format!("attempt {attempt}"),
                ));
                SchedulerCommand::Execute { agent, attempt }
            }
            Resolution::Done => {
                events.extend(self.complete());
                SchedulerCommand::Finished(self.state.status())
            }
            Resolution::Blocked { waiting } => {
                events.extend(self.block(&waiting));
                SchedulerCommand::Finished(self.state.status())
            }
        };

        self.command(command, events)
    }

    /// Record the payload of the in-flight agent.
    pub fn record_success(&mut self, agent: &str, payload: Value) -> Vec<ProgressEvent> {
        let Some(attempt) = self.take_in_flight(agent) else {
            return Vec::new();
        };

        if !self
            .state
            .insert_result(agent, AgentResult::completed(payload, attempt))
        {
            return Vec::new();
        }
        self.state.set_last_error(None);
        self.state.raise_progress(self.proportional_progress());

        info!(run_id = %self.state.run_id(), agent = %agent, attempt, "agent completed");
        let message = format!("completed on attempt {attempt}");
        vec![self.event(Some(agent), Phase::Completed, message)]
    }

    /// Record a failed attempt of the in-flight agent and apply the retry
    /// policy.
    pub fn record_failure(&mut self, agent: &str, failure: &AgentFailure) -> Vec<ProgressEvent> {
        let Some(attempt) = self.take_in_flight(agent) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        let message = failure.to_string();

        self.state.push_error(ErrorRecord::for_agent(
            agent,
            ErrorKind::AgentExecution,
            attempt,
            message.clone(),
        ));
        self.state.set_last_error(Some(message.clone()));

        let limit = self
            .registry
            .get(agent)
            .map(|a| a.retry_limit())
            .unwrap_or(0);

        if self.state.retry_count(agent) < limit {
            let granted = self.state.grant_retry(agent);
            warn!(
                run_id = %self.state.run_id(),
                agent = %agent,
                attempt,
                retry = granted,
                retry_limit = limit,
                error = %message,
                "agent failed; retrying"
            );
            events.push(self.event(
                Some(agent),
                Phase::Failed,
                format!("attempt {attempt} failed, retry {granted}/{limit}: {message}"),
            ));
            return events;
        }

        events.push(self.event(
            Some(agent),
            Phase::Failed,
            format!("attempt {attempt} failed, no retries left: {message}"),
        ));
        self.state.push_error(ErrorRecord::for_agent(
            agent,
            ErrorKind::RetryExhausted,
            attempt,
            format!("exhausted {limit} retries"),
        ));

        if !self.registry.is_critical(agent) {
            warn!(
                run_id = %self.state.run_id(),
                agent = %agent,
                attempts = attempt,
                "non-critical agent exhausted retries; skipping"
            );
            let reason = format!("skipped after {attempt} failed attempts: {message}");
            self.state
                .insert_result(agent, AgentResult::skipped(reason, attempt));
            self.state.raise_progress(self.proportional_progress());
            events.push(self.event(
                Some(agent),
                Phase::Progress,
                format!("skipped after {attempt} attempts"),
            ));
            return events;
        }

        let reason = format!("agent '{agent}' exhausted {limit} retries: {message}");
        error!(run_id = %self.state.run_id(), agent = %agent, %reason, "run failed");
        self.state.set_terminal_reason(reason.clone());
        self.fail_run(reason, &mut events);
        events
    }

    /// Map sub-progress of the in-flight agent onto overall run progress.
    ///
    /// Overall progress never reaches the next whole-agent boundary until the
    /// agent actually finishes, and never exceeds 99 before completion.
    pub fn record_sub_progress(
        &mut self,
        agent: &str,
        percent: u8,
        message: &str,
    ) -> Option<ProgressEvent> {
        match &self.in_flight {
            Some(f) if f.agent == agent => {}
            _ => {
                debug!(agent = %agent, "ignoring sub-progress from an agent not in flight");
                return None;
            }
        }
        if self.state.is_terminal() {
            return None;
        }

        let total = self.registry.len().max(1) as f64;
        let done = self.state.results().len() as f64;
        let percent = f64::from(percent.min(100));
        let raw = (100.0 * (done + percent / 100.0) / total).round();
        let boundary = (100.0 * (done + 1.0) / total).round() - 1.0;
        let overall = raw.min(boundary).min(99.0).max(0.0) as u8;

        self.state.raise_progress(overall);
        Some(self.event(Some(agent), Phase::Progress, message.to_string()))
    }

    /// `running -> paused`. Takes effect between agents.
    pub fn pause(&mut self) -> Result<ProgressEvent> {
        self.state.transition(RunStatus::Paused, "pause")?;
        info!(run_id = %self.state.run_id(), "run paused");
        Ok(self.event(None, Phase::Paused, "run paused".to_string()))
    }

    /// `paused -> running`.
    pub fn resume(&mut self) -> Result<ProgressEvent> {
        self.state.transition(RunStatus::Running, "resume")?;
        info!(run_id = %self.state.run_id(), "run resumed");
        Ok(self.event(None, Phase::Resumed, "run resumed".to_string()))
    }

    fn complete(&mut self) -> Vec<ProgressEvent> {
        self.state.set_current_agent(None);
        self.state.raise_progress(100);
        if let Err(e) = self.state.transition(RunStatus::Completed, "complete") {
            error!(run_id = %self.state.run_id(), error = %e, "could not complete run");
            return Vec::new();
        }

        let skipped = self.state.skipped().count();
        let message = if skipped == 0 {
            format!("all {} agents finished", self.registry.len())
        } else {
            format!(
                "all {} agents finished, {skipped} skipped",
                self.registry.len()
            )
        };
        info!(
            run_id = %self.state.run_id(),
            skipped,
            executions = self.executions,
            "run completed"
        );
        vec![self.event(None, Phase::Completed, message)]
    }

    fn block(&mut self, waiting: &[BlockedAgent]) -> Vec<ProgressEvent> {
        let detail = waiting
            .iter()
            .map(|b| format!("{} waits on [{}]", b.agent, b.missing.join(", ")))
            .collect::<Vec<_>>()
            .join("; ");
        error!(run_id = %self.state.run_id(), %detail, "workflow blocked");

        self.state
            .push_error(ErrorRecord::for_run(ErrorKind::DependencyBlocked, detail));
        let reason = "workflow blocked: unmet dependencies".to_string();
        self.state.set_terminal_reason(reason.clone());

        let mut events = Vec::new();
        self.fail_run(reason, &mut events);
        events
    }

    fn fail_run(&mut self, reason: String, events: &mut Vec<ProgressEvent>) {
        if let Err(e) = self.state.transition(RunStatus::Error, "fail") {
            error!(run_id = %self.state.run_id(), error = %e, "could not fail run");
            return;
        }
        events.push(self.event(None, Phase::Failed, reason));
    }

    fn validate_parameters(&self) -> std::result::Result<(), String> {
        let Some(params) = self.state.parameters().as_object() else {
            return Err("run parameters must be a JSON object".to_string());
        };

        let mut missing_per_root = Vec::new();
        for root in self.registry.roots() {
            let missing: Vec<&str> = root
                .required_parameters()
                .iter()
                .filter(|key| params.get(key.as_str()).is_none_or(Value::is_null))
                .map(String::as_str)
                .collect();
            if missing.is_empty() {
                return Ok(());
            }
            missing_per_root.push(format!("{} needs [{}]", root.name(), missing.join(", ")));
        }

        Err(format!(
            "no agent can start with the given parameters: {}",
            missing_per_root.join("; ")
        ))
    }

    fn take_in_flight(&mut self, agent: &str) -> Option<u32> {
        match self.in_flight.take() {
            Some(f) if f.agent == agent => Some(f.attempt),
            other => {
                warn!(
                    run_id = %self.state.run_id(),
                    agent = %agent,
                    in_flight = ?other.as_ref().map(|f| f.agent.as_str()),
                    "outcome reported for an agent that is not in flight"
                );
                self.in_flight = other;
                None
            }
        }
    }

    /// `round(100 * results / agents)`, kept below 100 until every agent has
    /// a result.
    fn proportional_progress(&self) -> u8 {
        let total = self.registry.len().max(1);
        let done = self.state.results().len().min(total);
        let pct = (200 * done + total) / (2 * total);
        if done < total {
            pct.min(99) as u8
        } else {
            100
        }
    }

    fn event(&mut self, agent: Option<&str>, phase: Phase, message: String) -> ProgressEvent {
        self.sequence += 1;
        ProgressEvent {
            run_id: self.state.run_id().clone(),
            sequence: self.sequence,
            agent_name: agent.map(str::to_string),
            phase,
            percent: self.state.progress(),
            message,
            timestamp: Utc::now(),
        }
    }

    fn command(&self, command: SchedulerCommand, events: Vec<ProgressEvent>) -> SchedulerStep {
        SchedulerStep { command, events }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::CannedAgent;

    fn agent(name: &str, deps: &[&str]) -> CannedAgent {
        CannedAgent::new(name, json!(null)).after(deps.iter().copied())
    }

    fn market() -> Arc<AgentRegistry> {
        Arc::new(
            AgentRegistry::builder()
                .register(agent("product", &[]))
                .register(agent("place", &["product"]).with_retry_limit(2))
                .register(agent("price", &["product", "place"]))
                .build()
                .unwrap(),
        )
    }

    fn started(registry: Arc<AgentRegistry>) -> Scheduler {
        let mut s = Scheduler::new(registry, RunId::from("run-1"), Value::Null);
        s.begin().unwrap();
        s
    }

    fn expect_execute(s: &mut Scheduler) -> (AgentName, u32) {
        match s.step().command {
            SchedulerCommand::Execute { agent, attempt } => (agent, attempt),
            other => panic!("expected Execute, got {other:?}"),
        }
    }

    #[test]
    fn happy_path_runs_in_order_and_completes() {
        let mut s = started(market());
        for expected in ["product", "place", "price"] {
            let (agent, attempt) = expect_execute(&mut s);
            assert_eq!(agent, expected);
            assert_eq!(attempt, 1);
            s.record_success(&agent, json!({ "from": expected }));
        }

        let step = s.step();
        assert_eq!(step.command, SchedulerCommand::Finished(RunStatus::Completed));
        assert_eq!(step.events.len(), 1);
        assert!(step.events[0].is_run_level());
        assert_eq!(s.state().progress(), 100);
        assert_eq!(s.state().current_agent(), None);
        assert_eq!(s.state().results().len(), 3);
    }

    #[test]
    fn critical_agent_gets_limit_plus_one_attempts() {
        let mut s = started(market());
        let (agent, _) = expect_execute(&mut s);
        s.record_success(&agent, json!(1));

        for expected_attempt in 1..=3 {
            let (agent, attempt) = expect_execute(&mut s);
            assert_eq!(agent, "place");
            assert_eq!(attempt, expected_attempt);
            s.record_failure(&agent, &AgentFailure::new("upstream 503"));
            assert!(s.state().retry_count("place") <= 2);
        }

        assert_eq!(s.state().status(), RunStatus::Error);
        assert_eq!(s.state().retry_count("place"), 2);
        assert_eq!(s.state().results().keys().collect::<Vec<_>>(), vec!["product"]);
        assert!(s.state().terminal_reason().unwrap().contains("place"));
        assert_eq!(s.step().command, SchedulerCommand::Finished(RunStatus::Error));
    }

    #[test]
    fn non_critical_agent_is_tombstoned() {
        let registry = Arc::new(
            AgentRegistry::builder()
                .register(agent("product", &[]))
                .register(agent("promotion", &["product"]).with_retry_limit(1))
                .register(agent("report", &["promotion"]))
                .non_critical("promotion")
                .build()
                .unwrap(),
        );
        let mut s = started(registry);
        let (a, _) = expect_execute(&mut s);
        s.record_success(&a, json!(1));

        for _ in 0..2 {
            let (a, _) = expect_execute(&mut s);
            s.record_failure(&a, &AgentFailure::new("no promotions found"));
        }

        let promo = s.state().result("promotion").unwrap();
        assert!(promo.is_skipped());
        assert_eq!(promo.attempts(), 2);

        let (next, _) = expect_execute(&mut s);
        assert_eq!(next, "report");
        s.record_success(&next, json!("done"));
        assert_eq!(
            s.step().command,
            SchedulerCommand::Finished(RunStatus::Completed)
        );
    }

    #[test]
    fn sequence_numbers_have_no_gaps() {
        let mut s = Scheduler::new(market(), RunId::from("r"), json!({}));
        let mut events = s.begin().unwrap();
        loop {
            let step = s.step();
            events.extend(step.events);
            match step.command {
                SchedulerCommand::Execute { agent, .. } => {
                    events.extend(s.record_success(&agent, json!(null)));
                }
                _ => break,
            }
        }
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        let expected: Vec<u64> = (1..=events.len() as u64).collect();
        assert_eq!(seqs, expected);
    }

    #[test]
    fn sub_progress_stays_below_next_boundary() {
        let mut s = started(market());
        let (agent, _) = expect_execute(&mut s);

        let ev = s.record_sub_progress(&agent, 50, "halfway").unwrap();
        assert_eq!(ev.percent, 17);
        s.record_sub_progress(&agent, 100, "almost");
        assert_eq!(s.state().progress(), 32);
        s.record_sub_progress(&agent, 10, "late report");
        assert_eq!(s.state().progress(), 32);

        s.record_success(&agent, json!(null));
        assert_eq!(s.state().progress(), 33);
        assert!(s.record_sub_progress("product", 10, "stale").is_none());
    }

    #[test]
    fn pause_makes_step_idle() {
        let mut s = started(market());
        let (agent, _) = expect_execute(&mut s);
        s.record_success(&agent, json!(null));

        s.pause().unwrap();
        assert_eq!(s.step().command, SchedulerCommand::Idle);
        assert_eq!(s.state().current_agent(), Some("product"));
        assert!(s.pause().is_err());

        s.resume().unwrap();
        let (agent, _) = expect_execute(&mut s);
        assert_eq!(agent, "place");
    }

    #[test]
    fn parameters_must_satisfy_some_root() {
        let registry = Arc::new(
            AgentRegistry::builder()
                .register(
                    agent("product", &[])
                        .with_required_parameters(vec!["restaurant_name".into()]),
                )
                .build()
                .unwrap(),
        );

        let mut s = Scheduler::new(registry.clone(), RunId::from("bad"), json!({"city": "x"}));
        let err = s.begin().unwrap_err();
        assert!(matches!(err, MarketdagError::Validation(_)));
        assert_eq!(s.state().status(), RunStatus::Error);
        assert_eq!(s.step().command, SchedulerCommand::Finished(RunStatus::Error));

        let mut s = Scheduler::new(registry.clone(), RunId::from("arr"), json!([1, 2]));
        assert!(s.begin().is_err());

        let mut s = Scheduler::new(
            registry,
            RunId::from("ok"),
            json!({"restaurant_name": "Bistro"}),
        );
        assert!(s.begin().is_ok());
        assert_eq!(s.state().status(), RunStatus::Running);
    }

    #[test]
    fn outcome_for_wrong_agent_is_ignored() {
        let mut s = started(market());
        let _ = expect_execute(&mut s);
        assert!(s.record_success("price", json!(null)).is_empty());
        assert!(!s.state().has_result("price"));
        assert!(!s.record_success("product", json!(null)).is_empty());
    }
}
