// src/dag/resolver.rs

//! Pure dependency resolution over a registry and a run snapshot.

use serde::Serialize;

use crate::dag::registry::AgentRegistry;
use crate::run::RunState;
use crate::types::AgentName;

/// What the scheduler should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Run this agent.
    Run(AgentName),
    /// Every registered agent has a result (completed or skipped).
    Done,
    /// Agents remain but none has all its dependencies present.
    Blocked { waiting: Vec<BlockedAgent> },
}

/// An unfinished agent and the dependencies it is still missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedAgent {
    pub agent: AgentName,
    pub missing: Vec<AgentName>,
}

/// Decides which agent is eligible next.
///
/// A dependency counts as satisfied as soon as its name is a key of
/// `RunState::results`; a skipped tombstone satisfies it just like a
/// completed result. Ties are broken by registration order.
#[derive(Debug, Clone, Copy)]
pub struct DependencyResolver<'r> {
    registry: &'r AgentRegistry,
}

impl<'r> DependencyResolver<'r> {
    pub fn new(registry: &'r AgentRegistry) -> Self {
        Self { registry }
    }

    /// `true` iff every dependency of `agent` is present in `state.results`.
    ///
    /// Unknown agents are never runnable.
    pub fn can_run(&self, agent: &str, state: &RunState) -> bool {
        self.can_run_with(agent, |dep| state.has_result(dep))
    }

    /// The next agent to run, or whether the run is done or blocked.
    pub fn next_eligible(&self, state: &RunState) -> Resolution {
        match self.first_ready(|name| state.has_result(name)) {
            Some(name) => Resolution::Run(name.to_string()),
            None if self.registry.names().all(|n| state.has_result(n)) => Resolution::Done,
            None => Resolution::Blocked {
                waiting: self.blocked_agents(state),
            },
        }
    }

    /// Every agent that could run right now, in registration order.
    pub fn eligible(&self, state: &RunState) -> Vec<&'r str> {
        self.registry
            .names()
            .filter(|name| !state.has_result(name) && self.can_run(name, state))
            .collect()
    }

    /// The order agents would run in if every attempt succeeded.
    pub fn planned_order(&self) -> Vec<&'r str> {
        let mut done: Vec<&'r str> = Vec::with_capacity(self.registry.len());
        while let Some(next) = self.first_ready(|name| done.iter().any(|d| *d == name)) {
            done.push(next);
        }
        done
    }

    fn blocked_agents(&self, state: &RunState) -> Vec<BlockedAgent> {
        self.registry
            .agents()
            .filter(|a| !state.has_result(a.name()))
            .map(|a| BlockedAgent {
                agent: a.name().to_string(),
                missing: a
                    .dependencies()
                    .iter()
                    .filter(|d| !state.has_result(d))
                    .cloned()
                    .collect(),
            })
            .collect()
    }

    fn can_run_with<F>(&self, agent: &str, present: F) -> bool
    where
        F: Fn(&str) -> bool,
    {
        match self.registry.get(agent) {
            Some(unit) => unit.dependencies().iter().all(|d| present(d)),
            None => false,
        }
    }

    fn first_ready<F>(&self, present: F) -> Option<&'r str>
    where
        F: Fn(&str) -> bool,
    {
        self.registry
            .names()
            .find(|name| !present(*name) && self.can_run_with(name, &present))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::agent::{AgentUnit, CannedAgent};
    use crate::run::{AgentResult, RunId, RunStatus};

    fn agent(name: &str, deps: &[&str]) -> CannedAgent {
        CannedAgent::new(name, json!(null)).after(deps.iter().copied())
    }

    fn market_registry() -> AgentRegistry {
        AgentRegistry::builder()
            .register(agent("product", &[]))
            .register(agent("place", &["product"]))
            .register(agent("price", &["product", "place"]))
            .build()
            .unwrap()
    }

    fn running_state(reg: &AgentRegistry) -> RunState {
        let mut s = RunState::new(RunId::from("r"), json!({}), reg.names());
        s.transition(RunStatus::Running, "start").unwrap();
        s
    }

    #[test]
    fn picks_agents_in_dependency_order() {
        let reg = market_registry();
        let resolver = DependencyResolver::new(&reg);
        let mut s = running_state(&reg);

        assert_eq!(resolver.next_eligible(&s), Resolution::Run("product".into()));
        s.insert_result("product", AgentResult::completed(json!(1), 1));
        assert_eq!(resolver.next_eligible(&s), Resolution::Run("place".into()));
        assert!(!resolver.can_run("price", &s));
        s.insert_result("place", AgentResult::completed(json!(2), 1));
        assert_eq!(resolver.next_eligible(&s), Resolution::Run("price".into()));
        s.insert_result("price", AgentResult::completed(json!(3), 1));
        assert_eq!(resolver.next_eligible(&s), Resolution::Done);
    }

    #[test]
    fn tombstone_satisfies_dependents() {
        let reg = market_registry();
        let resolver = DependencyResolver::new(&reg);
        let mut s = running_state(&reg);
        s.insert_result("product", AgentResult::completed(json!(1), 1));
        s.insert_result("place", AgentResult::skipped("retries exhausted", 3));

        assert!(resolver.can_run("price", &s));
        assert_eq!(resolver.next_eligible(&s), Resolution::Run("price".into()));
    }

    #[test]
    fn registration_order_breaks_ties() {
        let reg = AgentRegistry::builder()
            .register(agent("zeta", &[]))
            .register(agent("alpha", &[]))
            .build()
            .unwrap();
        let resolver = DependencyResolver::new(&reg);
        let s = running_state(&reg);

        assert_eq!(resolver.next_eligible(&s), Resolution::Run("zeta".into()));
        assert_eq!(resolver.eligible(&s), vec!["zeta", "alpha"]);
    }

    #[test]
    fn resolution_is_idempotent_on_a_snapshot() {
        let reg = market_registry();
        let resolver = DependencyResolver::new(&reg);
        let mut s = running_state(&reg);
        s.insert_result("product", AgentResult::completed(json!(1), 1));

        let snapshot = s.clone();
        assert_eq!(resolver.next_eligible(&snapshot), resolver.next_eligible(&snapshot));
        assert_eq!(snapshot, s);
    }

    #[test]
    fn unsatisfiable_registry_is_blocked() {
        let agents: Vec<Arc<dyn AgentUnit>> = vec![
            Arc::new(agent("A", &[])),
            Arc::new(agent("B", &["C"])),
            Arc::new(agent("C", &["B"])),
        ];
        let reg = AgentRegistry::from_parts_unchecked(agents);
        let resolver = DependencyResolver::new(&reg);
        let mut s = running_state(&reg);
        s.insert_result("A", AgentResult::completed(json!(null), 1));

        match resolver.next_eligible(&s) {
            Resolution::Blocked { waiting } => {
                assert_eq!(waiting.len(), 2);
                assert_eq!(waiting[0].agent, "B");
                assert_eq!(waiting[0].missing, vec!["C".to_string()]);
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[test]
    fn planned_order_follows_dependencies() {
        let reg = AgentRegistry::builder()
            .register(agent("price", &["product", "place"]))
            .register(agent("place", &["product"]))
            .register(agent("product", &[]))
            .build()
            .unwrap();
        let resolver = DependencyResolver::new(&reg);
        assert_eq!(resolver.planned_order(), vec!["product", "place", "price"]);
    }
}
