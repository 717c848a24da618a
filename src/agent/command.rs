// src/agent/command.rs

//! Agent backed by a shell command.
//!
//! Protocol:
//! - the command runs under `sh -c` (`cmd /C` on Windows);
//! - stdin receives one JSON document:
//!   `{"run_id", "agent", "attempt", "parameters", "results"}`;
//! - stdout lines matching the progress pattern (default
//!   `PROGRESS <percent> [message]`) are reported as sub-progress;
//! - every other stdout line is the result payload, parsed as JSON if
//!   possible and kept as a string otherwise;
//! - a non-zero exit status is a failure carrying the tail of stderr.
//!
//! The optional timeout kills the process and fails the attempt.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::agent::{AgentContext, AgentFailure, AgentUnit};
use crate::types::AgentName;

/// Number of trailing stderr lines kept for failure messages.
const STDERR_TAIL: usize = 5;

static DEFAULT_PROGRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^PROGRESS\s+(?P<percent>\d{1,3})(?:\s+(?P<message>.*))?$")
        .expect("default progress pattern is a valid regex")
});

#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: AgentName,
    cmd: String,
    deps: Vec<AgentName>,
    retry_limit: u32,
    estimated_duration: Option<Duration>,
    required_parameters: Vec<String>,
    timeout: Option<Duration>,
    working_dir: Option<PathBuf>,
    progress_pattern: Regex,
}

impl CommandAgent {
    pub fn new(name: impl Into<AgentName>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            deps: Vec::new(),
            retry_limit: 0,
            estimated_duration: None,
            required_parameters: Vec::new(),
            timeout: None,
            working_dir: None,
            progress_pattern: DEFAULT_PROGRESS_PATTERN.clone(),
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

    pub fn timeout(mut self, d: Option<Duration>) -> Self {
        self.timeout = d;
        self
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    /// Replace the stdout progress pattern.
    ///
    /// The pattern may use the named groups `percent` and `message`.
    pub fn progress_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.progress_pattern = Regex::new(pattern)?;
        Ok(self)
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    fn shell_command(&self) -> Command {
        let mut c = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.cmd);
            c
        };
        if let Some(dir) = &self.working_dir {
            c.current_dir(dir);
        }
        c
    }

    async fn run_process(&self, ctx: &AgentContext) -> Result<Value, AgentFailure> {
        info!(
            run_id = %ctx.run_id(),
            agent = %self.name,
            attempt = ctx.attempt(),
            cmd = %self.cmd,
            "starting agent process"
        );

        let mut cmd = self.shell_command();
        cmd.env("MARKETDAG_RUN_ID", ctx.run_id().as_str())
            .env("MARKETDAG_AGENT", &self.name)
            .env("MARKETDAG_ATTEMPT", ctx.attempt().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning process for agent '{}'", self.name))?;

        let input = serde_json::to_vec(&json!({
            "run_id": ctx.run_id(),
            "agent": ctx.agent(),
            "attempt": ctx.attempt(),
            "parameters": ctx.parameters(),
            "results": ctx.prior_results(),
        }))
        .context("serialising agent input")?;

        // Written from a separate task: a command that never reads stdin must
        // not block us while we drain its stdout.
        if let Some(mut stdin) = child.stdin.take() {
            let agent = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(agent = %agent, error = %e, "agent did not consume stdin");
                }
            });
        }

        let stderr_task = child.stderr.take().map(|stderr| {
            let agent = self.name.clone();
            tokio::spawn(async move {
                let mut tail: Vec<String> = Vec::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(agent = %agent, "stderr: {}", line);
                    if tail.len() == STDERR_TAIL {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
                tail
            })
        });

        let mut output = String::new();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .with_context(|| format!("reading stdout of agent '{}'", self.name))?
            {
                if let Some((percent, message)) =
                    parse_progress_line(&self.progress_pattern, &line)
                {
                    ctx.report_progress(percent, message);
                } else {
                    output.push_str(&line);
                    output.push('\n');
                }
            }
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("waiting for process of agent '{}'", self.name))?;

        let stderr_tail = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };

        let code = status.code().unwrap_or(-1);
        info!(
            run_id = %ctx.run_id(),
            agent = %self.name,
            exit_code = code,
            success = status.success(),
            "agent process exited"
        );

        if !status.success() {
            let mut message = format!("command exited with code {code}");
            if !stderr_tail.is_empty() {
                message.push_str(": ");
                message.push_str(&stderr_tail.join(" | "));
            }
            return Err(AgentFailure::new(message));
        }

        Ok(parse_output(&output))
    }
}

/// Interpret captured stdout as a payload.
/// Match a stdout line against the progress pattern. Percentages above 100
/// are clamped; an unparsable percentage reads as 0.
fn parse_progress_line(pattern: &Regex, line: &str) -> Option<(u8, String)> {
    let caps = pattern.captures(line)?;
    let percent = caps
        .name("percent")
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .map_or(0, |p| p.min(100) as u8);
    let message = caps
        .name("message")
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    Some((percent, message))
}

fn parse_output(output: &str) -> Value {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[async_trait]
impl AgentUnit for CommandAgent {
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
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run_process(&ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        run_id = %ctx.run_id(),
                        agent = %self.name,
                        timeout_ms = limit.as_millis() as u64,
                        "agent process timed out; killing"
                    );
                    Err(AgentFailure::timeout(limit))
                }
            },
            None => self.run_process(&ctx).await,
        }
    }
}
