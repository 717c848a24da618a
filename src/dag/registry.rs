// src/dag/registry.rs

//! The set of agents a run executes, validated once at construction.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::agent::AgentUnit;
use crate::dag::graph::DagGraph;
use crate::errors::{MarketdagError, Result};
use crate::types::AgentName;

/// Immutable, validated collection of agents.
///
/// Registration order is preserved and is the scheduling priority: when
/// several agents are eligible, the one registered first runs first.
///
/// Guarantees after [`RegistryBuilder::build`]:
/// - names are unique
/// - every dependency names a registered agent, and no agent depends on itself
/// - the dependency graph is acyclic
/// - every non-critical name is registered
pub struct AgentRegistry {
    agents: Vec<Arc<dyn AgentUnit>>,
    index: HashMap<AgentName, usize>,
    non_critical: BTreeSet<AgentName>,
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names().collect::<Vec<_>>())
            .field("non_critical", &self.non_critical)
            .finish_non_exhaustive()
    }
}

impl AgentRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn AgentUnit>> {
        self.index.get(name).map(|&i| &self.agents[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Agents in registration order.
    pub fn agents(&self) -> impl Iterator<Item = &Arc<dyn AgentUnit>> {
        self.agents.iter()
    }

    /// Agent names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.agents.iter().map(|a| a.name())
    }

    /// Agents without dependencies, in registration order.
    pub fn roots(&self) -> impl Iterator<Item = &Arc<dyn AgentUnit>> {
        self.agents.iter().filter(|a| a.dependencies().is_empty())
    }

    /// Whether a run can proceed without this agent once it exhausts retries.
    pub fn is_critical(&self, name: &str) -> bool {
        !self.non_critical.contains(name)
    }

    pub fn non_critical(&self) -> impl Iterator<Item = &str> {
        self.non_critical.iter().map(|s| s.as_str())
    }

    /// Upper bound on agent executions in one run: `sum(retry_limit + 1)`.
    pub fn execution_bound(&self) -> u64 {
        self.agents
            .iter()
            .map(|a| u64::from(a.retry_limit()) + 1)
            .sum()
    }

    /// Registry that skips validation. Only for exercising resolver paths
    /// that a validated registry cannot reach.
    #[cfg(test)]
    pub(crate) fn from_parts_unchecked(agents: Vec<Arc<dyn AgentUnit>>) -> Self {
        let index = agents
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name().to_string(), i))
            .collect();
        Self {
            agents,
            index,
            non_critical: BTreeSet::new(),
        }
    }
}

/// Collects agents and the non-critical allow-list, then validates them.
#[derive(Default)]
pub struct RegistryBuilder {
    agents: Vec<Arc<dyn AgentUnit>>,
    non_critical: Vec<AgentName>,
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("agents", &self.agents.iter().map(|a| a.name()).collect::<Vec<_>>())
            .field("non_critical", &self.non_critical)
            .finish()
    }
}

impl RegistryBuilder {
    pub fn register(self, agent: impl AgentUnit + 'static) -> Self {
        self.register_arc(Arc::new(agent))
    }

    pub fn register_arc(mut self, agent: Arc<dyn AgentUnit>) -> Self {
        self.agents.push(agent);
        self
    }

    /// Mark an agent as skippable after it exhausts its retries.
    pub fn non_critical(mut self, name: impl Into<AgentName>) -> Self {
        self.non_critical.push(name.into());
        self
    }

    pub fn build(self) -> Result<AgentRegistry> {
        if self.agents.is_empty() {
            return Err(MarketdagError::ConfigError(
                "registry must contain at least one agent".to_string(),
            ));
        }

        let mut index = HashMap::new();
        for (i, agent) in self.agents.iter().enumerate() {
            if index.insert(agent.name().to_string(), i).is_some() {
                return Err(MarketdagError::DuplicateAgent(agent.name().to_string()));
            }
        }

        for agent in &self.agents {
            for dep in agent.dependencies() {
                if dep == agent.name() {
                    return Err(MarketdagError::SelfDependency(dep.clone()));
                }
                if !index.contains_key(dep) {
                    return Err(MarketdagError::UnknownDependency {
                        agent: agent.name().to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        DagGraph::from_edges(self.agents.iter().map(|a| (a.name(), a.dependencies())))
            .check_acyclic()?;

        let mut non_critical = BTreeSet::new();
        let mut seen = HashSet::new();
        for name in self.non_critical {
            if !index.contains_key(&name) {
                return Err(MarketdagError::ConfigError(format!(
                    "non-critical agent '{name}' is not registered"
                )));
            }
            if seen.insert(name.clone()) {
                non_critical.insert(name);
            }
        }

        debug!(
            agents = self.agents.len(),
            non_critical = non_critical.len(),
            "agent registry built"
        );

        Ok(AgentRegistry {
            agents: self.agents,
            index,
            non_critical,
        })
    }
}
