// src/config/model.rs

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

/// Workflow file as read from TOML, before validation.
///
/// ```toml
/// [config]
/// non_critical = ["promotion"]
///
/// [defaults]
/// retry_limit = 2
/// timeout = "30s"
///
/// [[agent]]
/// name = "product"
/// cmd = "scripts/product.sh"
///
/// [[agent]]
/// name = "place"
/// after = ["product"]
/// result = { density = 0.42 }
/// ```
///
/// Agents are an array so that file order is registration order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawWorkflowFile {
    #[serde(default)]
    pub config: ConfigSection,

    #[serde(default)]
    pub defaults: DefaultsSection,

    #[serde(default, rename = "agent")]
    pub agents: Vec<AgentConfig>,
}

/// `[config]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSection {
    /// Agents a run may skip once they exhaust their retries.
    #[serde(default)]
    pub non_critical: Vec<String>,
}

/// `[defaults]` section, applied to agents that do not override a field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultsSection {
    #[serde(default)]
    pub retry_limit: Option<u32>,

    /// Duration string (e.g. `"30s"`) for command agents.
    #[serde(default)]
    pub timeout: Option<String>,
}

/// One `[[agent]]` entry.
///
/// Exactly one of `cmd` (a shell command) or `result` (a fixed payload) must
/// be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub name: String,

    /// Agents whose results must be present before this one runs.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub cmd: Option<String>,

    #[serde(default)]
    pub result: Option<Value>,

    #[serde(default)]
    pub retry_limit: Option<u32>,

    #[serde(default)]
    pub estimated_duration: Option<String>,

    #[serde(default)]
    pub timeout: Option<String>,

    /// Parameter keys this agent needs at run start.
    #[serde(default)]
    pub required_parameters: Vec<String>,

    /// Regex for sub-progress lines on stdout (`cmd` only).
    #[serde(default)]
    pub progress_pattern: Option<String>,

    /// Working directory, relative to the workflow file (`cmd` only).
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Fail the first N attempts of each run (`result` only).
    #[serde(default)]
    pub fail_attempts: u32,

    /// Simulated latency (`result` only).
    #[serde(default)]
    pub delay: Option<String>,
}

impl AgentConfig {
    pub fn effective_retry_limit(&self, defaults: &DefaultsSection) -> u32 {
        self.retry_limit.or(defaults.retry_limit).unwrap_or(0)
    }

    pub fn effective_timeout<'a>(&'a self, defaults: &'a DefaultsSection) -> Option<&'a str> {
        self.timeout.as_deref().or(defaults.timeout.as_deref())
    }
}

/// A validated workflow: unique names, known acyclic dependencies, parseable
/// durations and patterns. Built through `TryFrom<RawWorkflowFile>`.
#[derive(Debug, Clone)]
pub struct WorkflowFile {
    config: ConfigSection,
    defaults: DefaultsSection,
    agents: Vec<AgentConfig>,
}

impl WorkflowFile {
    pub(crate) fn new_unchecked(
        config: ConfigSection,
        defaults: DefaultsSection,
        agents: Vec<AgentConfig>,
    ) -> Self {
        Self {
            config,
            defaults,
            agents,
        }
    }

    pub fn config(&self) -> &ConfigSection {
        &self.config
    }

    pub fn defaults(&self) -> &DefaultsSection {
        &self.defaults
    }

    /// Agents in file order.
    pub fn agents(&self) -> &[AgentConfig] {
        &self.agents
    }

    pub fn agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.name == name)
    }
}
