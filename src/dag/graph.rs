// src/dag/graph.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{MarketdagError, Result};

/// Dependency graph over agent names, borrowed from whoever declares the
/// agents (a registry builder or a raw workflow file).
///
/// Edge direction: dependency -> dependent.
#[derive(Debug, Clone, Default)]
pub struct DagGraph<'a> {
    graph: DiGraphMap<&'a str, ()>,
}

impl<'a> DagGraph<'a> {
    /// Build the graph from `(name, dependencies)` pairs.
    ///
    /// Dependencies on names that are not themselves listed are ignored;
    /// callers report those separately.
    pub fn from_edges<I, D, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, D)>,
        D: IntoIterator<Item = &'a S>,
        S: AsRef<str> + 'a + ?Sized,
    {
        let agents: Vec<(&'a str, Vec<&'a str>)> = agents
            .into_iter()
            .map(|(name, deps)| {
                let deps = deps
                    .into_iter()
                    .map(|d| <S as AsRef<str>>::as_ref(d))
                    .collect();
                (name, deps)
            })
            .collect();

        let mut graph = DiGraphMap::new();
        for (name, _) in &agents {
            graph.add_node(*name);
        }
        for (name, deps) in &agents {
            for dep in deps {
                if graph.contains_node(*dep) {
                    graph.add_edge(*dep, *name, ());
                }
            }
        }

        Self { graph }
    }

    /// Fail with [`MarketdagError::DagCycle`] if the graph has a cycle.
    pub fn check_acyclic(&self) -> Result<()> {
        match toposort(&self.graph, None) {
            Ok(_order) => Ok(()),
            Err(cycle) => Err(MarketdagError::DagCycle(format!(
                "cycle detected in agent DAG involving agent '{}'",
                cycle.node_id()
            ))),
        }
    }
}
