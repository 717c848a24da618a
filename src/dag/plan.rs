// src/dag/plan.rs

//! Execution plan: the order a run takes when every agent succeeds first
//! time, with cumulative advisory durations.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::dag::registry::AgentRegistry;
use crate::dag::resolver::DependencyResolver;
use crate::types::{format_duration, AgentName};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    /// 1-based position in the plan.
    pub position: usize,
    pub agent: AgentName,
    pub dependencies: Vec<AgentName>,
    pub retry_limit: u32,
    pub critical: bool,
    pub estimated_duration: Option<Duration>,
    /// Sum of the estimates of this step and all steps before it.
    pub cumulative_estimate: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
    /// Agents without an estimate count as zero.
    pub total_estimate: Duration,
    /// Worst case number of agent executions (`sum(retry_limit + 1)`).
    pub max_executions: u64,
}

impl ExecutionPlan {
    pub fn for_registry(registry: &AgentRegistry) -> Self {
        let resolver = DependencyResolver::new(registry);
        let mut cumulative = Duration::ZERO;
        let mut steps = Vec::with_capacity(registry.len());

        for (i, name) in resolver.planned_order().into_iter().enumerate() {
            let Some(agent) = registry.get(name) else {
                continue;
            };
            let estimate = agent.estimated_duration();
            cumulative += estimate.unwrap_or_default();
            steps.push(PlanStep {
                position: i + 1,
                agent: name.to_string(),
                dependencies: agent.dependencies().to_vec(),
                retry_limit: agent.retry_limit(),
                critical: registry.is_critical(name),
                estimated_duration: estimate,
                cumulative_estimate: cumulative,
            });
        }

        Self {
            steps,
            total_estimate: cumulative,
            max_executions: registry.execution_bound(),
        }
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "plan ({} agents):", self.steps.len())?;
        for step in &self.steps {
            write!(f, "  {:>2}. {}", step.position, step.agent)?;
            if !step.dependencies.is_empty() {
                write!(f, " (after: {})", step.dependencies.join(", "))?;
            }
            if let Some(d) = step.estimated_duration {
                write!(f, " ~{}", format_duration(d))?;
            }
            if step.retry_limit > 0 {
                write!(f, " retries={}", step.retry_limit)?;
            }
            if !step.critical {
                write!(f, " [non-critical]")?;
            }
            writeln!(f)?;
        }
        writeln!(f, "estimated total: {}", format_duration(self.total_estimate))?;
        write!(f, "max executions: {}", self.max_executions)
    }
}
