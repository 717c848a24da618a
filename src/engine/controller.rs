// src/engine/controller.rs

//! Public API for starting and steering runs.
//!
//! The controller never mutates a `RunState` itself. Commands travel to the
//! run's task over a `watch` channel and take effect at the next iteration
//! boundary; reads come from the snapshot the task publishes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dag::AgentRegistry;
use crate::engine::broadcaster::{EventStream, ProgressBroadcaster};
use crate::engine::runtime::{ControlSignal, Runtime};
use crate::engine::scheduler::Scheduler;
use crate::errors::{MarketdagError, Result};
use crate::run::{AgentResult, ErrorRecord, RunId, RunState, RunStatus};
use crate::types::AgentName;

/// Final outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub results: BTreeMap<AgentName, AgentResult>,
    pub completion_order: Vec<AgentName>,
    pub errors: Vec<ErrorRecord>,
    /// `true` when at least one non-critical agent was skipped.
    pub degraded: bool,
    pub skipped: Vec<AgentName>,
}

impl RunReport {
    fn from_state(state: &RunState) -> Self {
        let skipped: Vec<AgentName> = state.skipped().map(str::to_string).collect();
        Self {
            run_id: state.run_id().clone(),
            results: state.results().clone(),
            completion_order: state.completion_order().to_vec(),
            errors: state.errors().to_vec(),
            degraded: !skipped.is_empty(),
            skipped,
        }
    }
}

struct RunHandle {
    control_tx: watch::Sender<ControlSignal>,
    snapshot_rx: watch::Receiver<RunState>,
    task: JoinHandle<RunState>,
}

impl RunHandle {
    fn snapshot(&self) -> RunState {
        self.snapshot_rx.borrow().clone()
    }

    /// The run task has closed the run's streams and let go of its state.
    fn is_finished(&self) -> bool {
        self.task.is_finished() || self.snapshot_rx.has_changed().is_err()
    }

    /// Status as seen by a caller, counting a pending pause/resume as
    /// already applied.
    fn effective_status(&self) -> RunStatus {
        let status = self.snapshot_rx.borrow().status();
        match (status, *self.control_tx.borrow()) {
            (RunStatus::Running, ControlSignal::Pause) => RunStatus::Paused,
            (RunStatus::Paused, ControlSignal::Run) => RunStatus::Running,
            (status, _) => status,
        }
    }
}

/// Owns every run started against one agent registry.
///
/// All methods except [`RunController::wait`] are synchronous; starting a
/// run must happen inside a tokio runtime.
pub struct RunController {
    registry: Arc<AgentRegistry>,
    broadcaster: Arc<ProgressBroadcaster>,
    runs: Mutex<HashMap<RunId, RunHandle>>,
}

impl RunController {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self::with_broadcaster(registry, Arc::new(ProgressBroadcaster::new()))
    }

    pub fn with_broadcaster(
        registry: Arc<AgentRegistry>,
        broadcaster: Arc<ProgressBroadcaster>,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    /// Start a run with a fresh id.
    pub fn start(&self, parameters: Value) -> Result<RunId> {
        let run_id = RunId::new();
        self.start_with_id(run_id.clone(), parameters)?;
        Ok(run_id)
    }

    /// Start a run under a caller-chosen id, so the caller can subscribe
    /// before the first event is published.
    ///
    /// Fails with `Validation` if the parameters cannot start any agent; the
    /// run is then not registered.
    pub fn start_with_id(&self, run_id: RunId, parameters: Value) -> Result<()> {
        let mut runs = self.lock();
        if let Some(existing) = runs.get(&run_id) {
            return Err(MarketdagError::InvalidTransition {
                run_id,
                from: existing.effective_status(),
                command: "start",
            });
        }

        let mut scheduler = Scheduler::new(self.registry.clone(), run_id.clone(), parameters);
        let started = match scheduler.begin() {
            Ok(events) => events,
            Err(e) => {
                self.broadcaster.discard_subscribers(&run_id);
                return Err(e);
            }
        };
        // The id may belong to a stopped or removed run.
        self.broadcaster.reopen(&run_id);

        let (control_tx, control_rx) = watch::channel(ControlSignal::Run);
        let (snapshot_tx, snapshot_rx) = watch::channel(scheduler.state().clone());
        for event in &started {
            self.broadcaster.publish(event);
        }

        let runtime = Runtime::new(scheduler, control_rx, snapshot_tx, self.broadcaster.clone());
        let task = tokio::spawn(runtime.run());

        info!(run_id = %run_id, "run registered");
        runs.insert(
            run_id,
            RunHandle {
                control_tx,
                snapshot_rx,
                task,
            },
        );
        Ok(())
    }

    /// Request a pause. The agent currently executing finishes first.
    pub fn pause(&self, run_id: &RunId) -> Result<()> {
        self.signal(run_id, "pause", RunStatus::Running, ControlSignal::Pause)
    }

    /// Resume a paused run (or cancel a pending pause).
    pub fn resume(&self, run_id: &RunId) -> Result<()> {
        self.signal(run_id, "resume", RunStatus::Paused, ControlSignal::Run)
    }

    /// Abort a non-terminal run and forget it.
    ///
    /// The executing agent is cancelled, the run state is discarded and the
    /// run's event streams end without a completion event.
    pub fn stop(&self, run_id: &RunId) -> Result<()> {
        let mut runs = self.lock();
        let handle = runs
            .get(run_id)
            .ok_or_else(|| MarketdagError::RunNotFound(run_id.clone()))?;
        let status = handle.effective_status();
        if status.is_terminal() {
            return Err(MarketdagError::InvalidTransition {
                run_id: run_id.clone(),
                from: status,
                command: "stop",
            });
        }

        if let Some(handle) = runs.remove(run_id) {
            handle.task.abort();
        }
        self.broadcaster.close_run(run_id);
        warn!(run_id = %run_id, %status, "run stopped");
        Ok(())
    }

    /// Clone of the latest published state.
    pub fn snapshot(&self, run_id: &RunId) -> Result<RunState> {
        self.with_handle(run_id, RunHandle::snapshot)
    }

    /// Receiver that observes every published snapshot of a run.
    pub fn watch(&self, run_id: &RunId) -> Result<watch::Receiver<RunState>> {
        self.with_handle(run_id, |h| h.snapshot_rx.clone())
    }

    /// Wait until the run is terminal and return its final state.
    ///
    /// Returns `RunNotFound` if the run is unknown or gets stopped while
    /// waiting.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunState> {
        let mut rx = self.watch(run_id)?;
        let state = match rx.wait_for(RunState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => return Err(MarketdagError::RunNotFound(run_id.clone())),
        };
        // The task drops its sender only after closing the run's streams.
        while rx.changed().await.is_ok() {}
        Ok(state)
    }

    /// Results of a completed run.
    pub fn report(&self, run_id: &RunId) -> Result<RunReport> {
        let state = self.snapshot(run_id)?;
        if state.status() != RunStatus::Completed {
            return Err(MarketdagError::RunNotCompleted {
                run_id: run_id.clone(),
                status: state.status(),
            });
        }
        Ok(RunReport::from_state(&state))
    }

    /// Ids of every known run.
    pub fn runs(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Forget a finished run and return its final state.
    ///
    /// A run counts as finished once it is terminal and its task has closed
    /// the run's event streams; [`RunController::wait`] returns only then.
    pub fn remove(&self, run_id: &RunId) -> Result<RunState> {
        let mut runs = self.lock();
        let handle = runs
            .get(run_id)
            .ok_or_else(|| MarketdagError::RunNotFound(run_id.clone()))?;
        let state = handle.snapshot();
        if !state.is_terminal() || !handle.is_finished() {
            return Err(MarketdagError::InvalidTransition {
                run_id: run_id.clone(),
                from: state.status(),
                command: "remove",
            });
        }
        runs.remove(run_id);
        Ok(state)
    }

    /// Subscribe to the future events of a run.
    ///
    /// Unknown ids are accepted so a caller can subscribe before
    /// [`RunController::start_with_id`]. The stream of a terminal, stopped or
    /// removed run ends immediately.
    pub fn subscribe(&self, run_id: &RunId) -> EventStream {
        let terminal = self
            .lock()
            .get(run_id)
            .is_some_and(|h| h.snapshot_rx.borrow().is_terminal());
        if terminal {
            return EventStream::closed();
        }
        // A run that finishes after the check closes this stream itself.
        self.broadcaster.subscribe(run_id)
    }

    /// Subscribe to the events of every run.
    pub fn subscribe_all(&self) -> EventStream {
        self.broadcaster.subscribe_all()
    }

    fn signal(
        &self,
        run_id: &RunId,
        command: &'static str,
        required: RunStatus,
        signal: ControlSignal,
    ) -> Result<()> {
        let runs = self.lock();
        let handle = runs
            .get(run_id)
            .ok_or_else(|| MarketdagError::RunNotFound(run_id.clone()))?;
        let status = handle.effective_status();
        if status != required {
            return Err(MarketdagError::InvalidTransition {
                run_id: run_id.clone(),
                from: status,
                command,
            });
        }
        handle.control_tx.send_replace(signal);
        info!(run_id = %run_id, command, "control signal sent");
        Ok(())
    }

    fn with_handle<T>(&self, run_id: &RunId, f: impl FnOnce(&RunHandle) -> T) -> Result<T> {
        let runs = self.lock();
        runs.get(run_id)
            .map(f)
            .ok_or_else(|| MarketdagError::RunNotFound(run_id.clone()))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RunId, RunHandle>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RunController {
    fn drop(&mut self) {
        for (_, handle) in self.lock().drain() {
            handle.task.abort();
        }
    }
}
