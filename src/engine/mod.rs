// src/engine/mod.rs

//! Run orchestration.
//!
//! This module ties together:
//! - the pure [`Scheduler`] that owns one run's state and decides what runs next
//! - the async [`Runtime`] that executes agents and applies control signals
//! - the [`ProgressBroadcaster`] that fans events out to subscribers
//! - the [`RunController`] that starts, pauses, resumes and stops runs

pub mod broadcaster;
pub mod controller;
pub mod runtime;
pub mod scheduler;

pub use broadcaster::{EventStream, ProgressBroadcaster, ProgressSink, Scope};
pub use controller::{RunController, RunReport};
pub use runtime::{ControlSignal, Runtime};
pub use scheduler::{Scheduler, SchedulerCommand, SchedulerStep};
