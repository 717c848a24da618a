// src/agent/canned.rs

//! Agent that returns a fixed payload declared in the workflow file.
//!
//! Useful for simulated analyses and for exercising retry behaviour: the
//! first `fail_attempts` attempts of every run fail.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::agent::{AgentContext, AgentFailure, AgentUnit};
use crate::types::AgentName;

#[derive(Debug, Clone)]
pub struct CannedAgent {
    name: AgentName,
    deps: Vec<AgentName>,
    retry_limit: u32,
    estimated_duration: Option<Duration>,
    required_parameters: Vec<String>,
    payload: Value,
    fail_attempts: u32,
    delay: Option<Duration>,
}

impl CannedAgent {
    pub fn new(name: impl Into<AgentName>, payload: Value) -> Self {
        Self {
            name: name.into(),
            deps: Vec::new(),
            retry_limit: 0,
            estimated_duration: None,
            required_parameters: Vec::new(),
            payload,
            fail_attempts: 0,
            delay: None,
        }
    }

    pub fn after(mut self, deps: impl IntoIterator<Item = impl Into<AgentName>>) -> Self {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_estimated_duration(mut self, d: Option<Duration>) -> Self {
        self.estimated_duration = d;
        self
    }

    pub fn with_required_parameters(mut self, keys: Vec<String>) -> Self {
        self.required_parameters = keys;
        self
    }

    /// Fail the first `n` attempts of each run.
    pub fn fail_attempts(mut self, n: u32) -> Self {
        self.fail_attempts = n;
        self
    }

    /// Sleep this long before answering.
    pub fn delay(mut self, d: Option<Duration>) -> Self {
        self.delay = d;
        self
    }
}

#[async_trait]
impl AgentUnit for CannedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[AgentName] {
        &self.deps
    }

    fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    fn estimated_duration(&self) -> Option<Duration> {
        self.estimated_duration
    }

    fn required_parameters(&self) -> &[String] {
        &self.required_parameters
    }

    async fn execute(&self, ctx: AgentContext) -> Result<Value, AgentFailure> {
        if let Some(delay) = self.delay {
            ctx.report_progress(0, "waiting on simulated source");
            tokio::time::sleep(delay).await;
        }

        if ctx.attempt() <= self.fail_attempts {
            debug!(
                agent = %self.name,
                attempt = ctx.attempt(),
                fail_attempts = self.fail_attempts,
                "canned agent failing by configuration"
            );
            return Err(AgentFailure::new(format!(
                "simulated failure on attempt {} of '{}'",
                ctx.attempt(),
                self.name
            )));
        }

        Ok(self.payload.clone())
    }
}
