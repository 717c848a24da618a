// src/dag/mod.rs

//! Agent dependency graph and resolution.
//!
//! - [`graph`] holds the cycle check shared by registries and workflow files.
//! - [`registry`] owns the validated, ordered set of agents.
//! - [`resolver`] decides which agent is eligible next for a run snapshot.
//! - [`plan`] derives the execution plan used for dry runs.

pub mod graph;
pub mod plan;
pub mod registry;
pub mod resolver;

pub use graph::DagGraph;
pub use plan::{ExecutionPlan, PlanStep};
pub use registry::{AgentRegistry, RegistryBuilder};
pub use resolver::{BlockedAgent, DependencyResolver, Resolution};
