// src/run/event.rs

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::RunId;
use crate::types::AgentName;

/// Phase reported by a [`ProgressEvent`].
///
/// `Paused` and `Resumed` are run-level only; the other phases are used for
/// both agent-level and run-level events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Started,
    Progress,
    Completed,
    Failed,
    Paused,
    Resumed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Started => "started",
            Phase::Progress => "progress",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Paused => "paused",
            Phase::Resumed => "resumed",
        };
        f.write_str(s)
    }
}

/// Immutable record of one scheduler state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: RunId,
    /// Per-run sequence number, starting at 1, with no gaps.
    pub sequence: u64,
    /// `None` for run-level events (run completed, blocked, paused...).
    pub agent_name: Option<AgentName>,
    pub phase: Phase,
    /// Overall run progress at the time of the event.
    pub percent: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn is_run_level(&self) -> bool {
        self.agent_name.is_none()
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>3}%] ", self.percent)?;
        match &self.agent_name {
            Some(agent) => write!(f, "{agent} {}", self.phase)?,
            None => write!(f, "run {}", self.phase)?,
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}
