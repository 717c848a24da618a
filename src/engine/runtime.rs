// src/engine/runtime.rs

//! Async shell around the [`Scheduler`].
//!
//! One `Runtime` drives one run on its own tokio task. It is the only code
//! that touches the run's [`Scheduler`] (and therefore its `RunState`):
//! control signals from the controller are read at iteration boundaries,
//! agent sub-progress is applied while the agent executes, and every
//! mutation is published as a snapshot first and as events second.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::agent::{AgentContext, AgentFailure, ProgressReporter, SubProgress};
use crate::engine::broadcaster::ProgressBroadcaster;
use crate::engine::scheduler::{Scheduler, SchedulerCommand};
use crate::run::{ProgressEvent, RunState, RunStatus};
use crate::types::AgentName;

/// Desired execution mode, set by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
}

pub struct Runtime {
    scheduler: Scheduler,
    control_rx: watch::Receiver<ControlSignal>,
    snapshot_tx: watch::Sender<RunState>,
    broadcaster: Arc<ProgressBroadcaster>,
    parameters: Arc<Value>,
}

impl Runtime {
    pub fn new(
        scheduler: Scheduler,
        control_rx: watch::Receiver<ControlSignal>,
        snapshot_tx: watch::Sender<RunState>,
        broadcaster: Arc<ProgressBroadcaster>,
    ) -> Self {
        let parameters = Arc::new(scheduler.state().parameters().clone());
        Self {
            scheduler,
            control_rx,
            snapshot_tx,
            broadcaster,
            parameters,
        }
    }

    /// Drive the run until it reaches a terminal status and return the final
    /// state.
    ///
    /// The scheduler must already have been started with
    /// [`Scheduler::begin`].
    pub async fn run(mut self) -> RunState {
        let run_id = self.scheduler.state().run_id().clone();
        info!(run_id = %run_id, "run task started");
        self.snapshot_tx
            .send_replace(self.scheduler.state().clone());

        loop {
            if self.pause_requested() && self.scheduler.state().status() == RunStatus::Running {
                match self.scheduler.pause() {
                    Ok(event) => self.publish(vec![event]),
                    Err(e) => warn!(run_id = %run_id, error = %e, "pause rejected"),
                }
            }

            let step = self.scheduler.step();
            self.publish(step.events);

            match step.command {
                SchedulerCommand::Execute { agent, attempt } => {
                    self.execute(agent, attempt).await;
                    debug_assert!(self.scheduler.executions() <= self.scheduler.iteration_bound());
                }
                SchedulerCommand::Idle => self.wait_for_resume().await,
                SchedulerCommand::Finished(status) => {
                    info!(
                        run_id = %run_id,
                        %status,
                        executions = self.scheduler.executions(),
                        "run task finished"
                    );
                    break;
                }
            }
        }

        self.broadcaster.close_run(&run_id);
        self.scheduler.into_state()
    }

    fn pause_requested(&mut self) -> bool {
        *self.control_rx.borrow_and_update() == ControlSignal::Pause
    }

    async fn wait_for_resume(&mut self) {
        let run_id = self.scheduler.state().run_id().clone();
        debug!(run_id = %run_id, "waiting for resume");

        while self.pause_requested() {
            if self.control_rx.changed().await.is_err() {
                warn!(run_id = %run_id, "controller gone while paused; resuming");
                break;
            }
        }

        if self.scheduler.state().status() == RunStatus::Paused {
            match self.scheduler.resume() {
                Ok(event) => self.publish(vec![event]),
                Err(e) => error!(run_id = %run_id, error = %e, "resume rejected"),
            }
        }
    }

    async fn execute(&mut self, agent: AgentName, attempt: u32) {
        let run_id = self.scheduler.state().run_id().clone();
        let Some(unit) = self.scheduler.registry().get(&agent).cloned() else {
            let events = self
                .scheduler
                .record_failure(&agent, &AgentFailure::new("agent is not registered"));
            self.publish(events);
            return;
        };

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<SubProgress>();
        let ctx = AgentContext::new(
            run_id.clone(),
            agent.as_str(),
            attempt,
            self.parameters.clone(),
            Arc::new(self.scheduler.state().results().clone()),
            ProgressReporter::new(progress_tx),
        );

        debug!(run_id = %run_id, agent = %agent, attempt, "executing agent");
        let fut = AssertUnwindSafe(unit.execute(ctx)).catch_unwind();
        tokio::pin!(fut);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(progress) = progress_rx.recv() => self.apply_sub_progress(&agent, progress),
                outcome = &mut fut => break outcome,
            }
        };
        while let Ok(progress) = progress_rx.try_recv() {
            self.apply_sub_progress(&agent, progress);
        }

        let events = match outcome {
            Ok(Ok(payload)) => self.scheduler.record_success(&agent, payload),
            Ok(Err(failure)) => self.scheduler.record_failure(&agent, &failure),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(run_id = %run_id, agent = %agent, attempt, %message, "agent panicked");
                self.scheduler
                    .record_failure(&agent, &AgentFailure::panicked(message))
            }
        };
        self.publish(events);
    }

    fn apply_sub_progress(&mut self, agent: &str, progress: SubProgress) {
        if let Some(event) =
            self.scheduler
                .record_sub_progress(agent, progress.percent, &progress.message)
        {
            self.publish(vec![event]);
        }
    }

    /// Snapshot first, then events, so a subscriber reacting to an event
    /// never reads an older snapshot.
    fn publish(&self, events: Vec<ProgressEvent>) {
        if events.is_empty() {
            return;
        }
        self.snapshot_tx
            .send_replace(self.scheduler.state().clone());
        for event in &events {
            self.broadcaster.publish(event);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("agent panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("agent panicked: {s}")
    } else {
        "agent panicked".to_string()
    }
}
