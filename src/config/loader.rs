// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{RawWorkflowFile, WorkflowFile};
use crate::errors::Result;

/// Load a workflow file and return the raw, unvalidated model.
///
/// Use [`load_and_validate`] for anything that will build a registry.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawWorkflowFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

/// Parse workflow TOML without validating it.
pub fn parse_str(contents: &str) -> Result<RawWorkflowFile> {
    Ok(toml::from_str(contents)?)
}

/// Load a workflow file from path and validate it.
///
/// Checks names, `cmd`/`result` exclusivity, durations, progress patterns,
/// dependencies, the non-critical list and acyclicity.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<WorkflowFile> {
    let raw = load_from_path(&path)?;
    WorkflowFile::try_from(raw)
}

/// `Marketdag.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Marketdag.toml")
}
