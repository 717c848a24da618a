// src/config/agents.rs

//! Turn a validated [`WorkflowFile`] into an [`AgentRegistry`].

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::agent::{CannedAgent, CommandAgent};
use crate::config::model::{AgentConfig, WorkflowFile};
use crate::dag::AgentRegistry;
use crate::errors::{MarketdagError, Result};
use crate::types::parse_duration;

/// Build the registry described by `workflow`.
///
/// `base_dir` is the directory of the workflow file: commands run there, and
/// relative `working_dir`s are resolved against it.
pub fn build_registry(workflow: &WorkflowFile, base_dir: &Path) -> Result<AgentRegistry> {
    let defaults = workflow.defaults();
    let mut builder = AgentRegistry::builder();

    for cfg in workflow.agents() {
        let retry_limit = cfg.effective_retry_limit(defaults);
        let estimated = duration(cfg, "estimated_duration", cfg.estimated_duration.as_deref())?;

        builder = match (&cfg.cmd, &cfg.result) {
            (Some(cmd), _) => {
                let timeout = duration(cfg, "timeout", cfg.effective_timeout(defaults))?;
                let working_dir = match &cfg.working_dir {
                    Some(dir) => base_dir.join(dir),
                    None => base_dir.to_path_buf(),
                };
                let mut agent = CommandAgent::new(cfg.name.as_str(), cmd.as_str())
                    .after(cfg.after.iter().cloned())
                    .with_retry_limit(retry_limit)
                    .with_estimated_duration(estimated)
                    .with_required_parameters(cfg.required_parameters.clone())
                    .timeout(timeout)
                    .working_dir(Some(working_dir));
                if let Some(pattern) = &cfg.progress_pattern {
                    agent = agent.progress_pattern(pattern).map_err(|e| {
                        MarketdagError::ConfigError(format!(
                            "agent '{}' has an invalid `progress_pattern`: {e}",
                            cfg.name
                        ))
                    })?;
                }
                debug!(agent = %cfg.name, cmd = %cmd, retry_limit, "registering command agent");
                builder.register(agent)
            }
            (None, Some(payload)) => {
                let delay = duration(cfg, "delay", cfg.delay.as_deref())?;
                let agent = CannedAgent::new(cfg.name.as_str(), payload.clone())
                    .after(cfg.after.iter().cloned())
                    .with_retry_limit(retry_limit)
                    .with_estimated_duration(estimated)
                    .with_required_parameters(cfg.required_parameters.clone())
                    .fail_attempts(cfg.fail_attempts)
                    .delay(delay);
                debug!(agent = %cfg.name, retry_limit, "registering canned agent");
                builder.register(agent)
            }
            (None, None) => {
                return Err(MarketdagError::ConfigError(format!(
                    "agent '{}' needs either `cmd` or `result`",
                    cfg.name
                )));
            }
        };
    }

    for name in &workflow.config().non_critical {
        builder = builder.non_critical(name.as_str());
    }

    builder.build()
}

fn duration(cfg: &AgentConfig, field: &str, value: Option<&str>) -> Result<Option<Duration>> {
    value
        .map(parse_duration)
        .transpose()
        .map_err(|e| {
            MarketdagError::ConfigError(format!("agent '{}': invalid `{field}`: {e}", cfg.name))
        })
}
