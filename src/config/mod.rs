// src/config/mod.rs

//! Workflow configuration for marketdag.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a workflow file from disk (`loader.rs`).
//! - Validate names, dependencies and DAG correctness (`validate.rs`).
//! - Build the agent registry from a validated workflow (`agents.rs`).
//! - Assemble run parameters (`params.rs`).

pub mod agents;
pub mod loader;
pub mod model;
pub mod params;
pub mod validate;

pub use agents::build_registry;
pub use loader::{default_config_path, load_and_validate, load_from_path, parse_str};
pub use model::{AgentConfig, ConfigSection, DefaultsSection, RawWorkflowFile, WorkflowFile};
pub use params::load_parameters;
