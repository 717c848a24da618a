// src/config/validate.rs

use std::collections::HashSet;

use regex::Regex;

use crate::config::model::{AgentConfig, RawWorkflowFile, WorkflowFile};
use crate::dag::DagGraph;
use crate::errors::{MarketdagError, Result};
use crate::types::parse_duration;

impl TryFrom<RawWorkflowFile> for WorkflowFile {
    type Error = MarketdagError;

    fn try_from(raw: RawWorkflowFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_workflow(&raw)?;
        Ok(WorkflowFile::new_unchecked(
            raw.config,
            raw.defaults,
            raw.agents,
        ))
    }
}

fn validate_raw_workflow(wf: &RawWorkflowFile) -> Result<()> {
    ensure_has_agents(wf)?;
    validate_names(wf)?;
    validate_defaults(wf)?;
    for agent in &wf.agents {
        validate_agent(agent)?;
    }
    validate_agent_dependencies(wf)?;
    validate_non_critical(wf)?;
    validate_dag(wf)?;
    Ok(())
}

fn ensure_has_agents(wf: &RawWorkflowFile) -> Result<()> {
    if wf.agents.is_empty() {
        return Err(MarketdagError::ConfigError(
            "workflow must contain at least one [[agent]] entry".to_string(),
        ));
    }
    Ok(())
}

fn validate_names(wf: &RawWorkflowFile) -> Result<()> {
    let mut seen = HashSet::new();
    for agent in &wf.agents {
        if agent.name.trim().is_empty() {
            return Err(MarketdagError::ConfigError(
                "agent name must not be empty".to_string(),
            ));
        }
        if !seen.insert(agent.name.as_str()) {
            return Err(MarketdagError::DuplicateAgent(agent.name.clone()));
        }
    }
    Ok(())
}

fn validate_defaults(wf: &RawWorkflowFile) -> Result<()> {
    if let Some(timeout) = &wf.defaults.timeout {
        check_duration("[defaults]", "timeout", timeout)?;
    }
    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<()> {
    let name = &agent.name;
    match (&agent.cmd, &agent.result) {
        (Some(_), Some(_)) => {
            return Err(MarketdagError::ConfigError(format!(
                "agent '{name}' sets both `cmd` and `result`; choose one"
            )));
        }
        (None, None) => {
            return Err(MarketdagError::ConfigError(format!(
                "agent '{name}' needs either `cmd` or `result`"
            )));
        }
        (Some(cmd), None) => {
            if cmd.trim().is_empty() {
                return Err(MarketdagError::ConfigError(format!(
                    "agent '{name}' has an empty `cmd`"
                )));
            }
            if agent.fail_attempts > 0 || agent.delay.is_some() {
                return Err(MarketdagError::ConfigError(format!(
                    "agent '{name}': `fail_attempts` and `delay` only apply to `result` agents"
                )));
            }
        }
        (None, Some(_)) => {
            if agent.progress_pattern.is_some() || agent.working_dir.is_some() {
                return Err(MarketdagError::ConfigError(format!(
                    "agent '{name}': `progress_pattern` and `working_dir` only apply to `cmd` agents"
                )));
            }
        }
    }

    let section = format!("agent '{name}'");
    if let Some(d) = &agent.estimated_duration {
        check_duration(&section, "estimated_duration", d)?;
    }
    if let Some(d) = &agent.timeout {
        check_duration(&section, "timeout", d)?;
    }
    if let Some(d) = &agent.delay {
        check_duration(&section, "delay", d)?;
    }
    if let Some(pattern) = &agent.progress_pattern {
        Regex::new(pattern).map_err(|e| {
            MarketdagError::ConfigError(format!(
                "agent '{name}' has an invalid `progress_pattern`: {e}"
            ))
        })?;
    }
    Ok(())
}

fn check_duration(section: &str, field: &str, value: &str) -> Result<()> {
    parse_duration(value)
        .map(|_| ())
        .map_err(|e| MarketdagError::ConfigError(format!("{section}: invalid `{field}`: {e}")))
}

fn validate_agent_dependencies(wf: &RawWorkflowFile) -> Result<()> {
    let names: HashSet<&str> = wf.agents.iter().map(|a| a.name.as_str()).collect();
    for agent in &wf.agents {
        for dep in &agent.after {
            if dep == &agent.name {
                return Err(MarketdagError::SelfDependency(agent.name.clone()));
            }
            if !names.contains(dep.as_str()) {
                return Err(MarketdagError::UnknownDependency {
                    agent: agent.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_non_critical(wf: &RawWorkflowFile) -> Result<()> {
    for name in &wf.config.non_critical {
        if !wf.agents.iter().any(|a| &a.name == name) {
            return Err(MarketdagError::ConfigError(format!(
                "[config].non_critical names unknown agent '{name}'"
            )));
        }
    }
    Ok(())
}

fn validate_dag(wf: &RawWorkflowFile) -> Result<()> {
    DagGraph::from_edges(wf.agents.iter().map(|a| (a.name.as_str(), a.after.iter())))
        .check_acyclic()
}
