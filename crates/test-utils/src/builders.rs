#![allow(dead_code)]

use std::sync::Arc;

use marketdag::agent::AgentUnit;
use marketdag::config::{AgentConfig, RawWorkflowFile, WorkflowFile};
use marketdag::dag::AgentRegistry;
use serde_json::Value;

/// Builder for `WorkflowFile` to simplify test setup.
pub struct WorkflowBuilder {
    workflow: RawWorkflowFile,
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self {
            workflow: RawWorkflowFile::default(),
        }
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.workflow.agents.push(agent);
        self
    }

    pub fn non_critical(mut self, name: &str) -> Self {
        self.workflow.config.non_critical.push(name.to_string());
        self
    }

    pub fn default_retry_limit(mut self, limit: u32) -> Self {
        self.workflow.defaults.retry_limit = Some(limit);
        self
    }

    pub fn default_timeout(mut self, timeout: &str) -> Self {
        self.workflow.defaults.timeout = Some(timeout.to_string());
        self
    }

    pub fn build_raw(self) -> RawWorkflowFile {
        self.workflow
    }

    pub fn build(self) -> WorkflowFile {
        WorkflowFile::try_from(self.workflow).expect("Failed to build valid workflow from builder")
    }
}

impl Default for WorkflowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a single `[[agent]]` entry.
pub struct AgentConfigBuilder {
    agent: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn cmd(name: &str, cmd: &str) -> Self {
        Self {
            agent: AgentConfig {
                name: name.to_string(),
                cmd: Some(cmd.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn result(name: &str, payload: Value) -> Self {
        Self {
            agent: AgentConfig {
                name: name.to_string(),
                result: Some(payload),
                ..Default::default()
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.agent.after.push(dep.to_string());
        self
    }

    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.agent.retry_limit = Some(limit);
        self
    }

    pub fn fail_attempts(mut self, n: u32) -> Self {
        self.agent.fail_attempts = n;
        self
    }

    pub fn timeout(mut self, timeout: &str) -> Self {
        self.agent.timeout = Some(timeout.to_string());
        self
    }

    pub fn requires(mut self, key: &str) -> Self {
        self.agent.required_parameters.push(key.to_string());
        self
    }

    pub fn build(self) -> AgentConfig {
        self.agent
    }
}

/// Registry of the given agents in order, with an optional non-critical list.
pub fn registry<A>(agents: Vec<A>, non_critical: &[&str]) -> Arc<AgentRegistry>
where
    A: AgentUnit + 'static,
{
    let mut builder = AgentRegistry::builder();
    for agent in agents {
        builder = builder.register(agent);
    }
    for name in non_critical {
        builder = builder.non_critical(*name);
    }
    Arc::new(builder.build().expect("Failed to build registry from test agents"))
}
