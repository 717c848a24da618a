// src/run/mod.rs

//! Per-run data: the versioned [`RunState`] record and the
//! [`ProgressEvent`]s derived from its transitions.
//!
//! - [`state`] holds the run record, its status state machine, and the
//!   tagged result/error types stored in it.
//! - [`event`] holds the immutable progress events handed to subscribers.

pub mod event;
pub mod state;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use event::{Phase, ProgressEvent};
pub use state::{AgentResult, ErrorKind, ErrorRecord, RunState, RunStatus};

/// Opaque, unique identifier of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Fresh random run id (UUID v4).
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
