// src/engine/broadcaster.rs

//! Fan-out of [`ProgressEvent`]s to interested subscribers.
//!
//! Subscribers are either channels ([`EventStream`]) or callbacks
//! ([`ProgressSink`]). Channels are unbounded so a slow reader never loses
//! events; events of one run are delivered in publication order. A failing
//! sink is logged and otherwise ignored.
//!
//! Closing a run also remembers its id, so late subscribers get a stream that
//! ends at once instead of one that waits forever.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::run::{ProgressEvent, RunId};

/// Callback subscriber.
///
/// `deliver` runs on the run's task; keep it short.
pub trait ProgressSink: Send + Sync {
    fn deliver(&self, event: &ProgressEvent) -> anyhow::Result<()>;
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn deliver(&self, event: &ProgressEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Which events a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Run(RunId),
    All,
}

#[derive(Clone)]
enum Subscriber {
    Channel(mpsc::UnboundedSender<ProgressEvent>),
    Sink {
        name: String,
        sink: Arc<dyn ProgressSink>,
    },
}

impl Subscriber {
    fn is_closed(&self) -> bool {
        match self {
            Subscriber::Channel(tx) => tx.is_closed(),
            Subscriber::Sink { .. } => false,
        }
    }
}

/// How many closed run ids are remembered.
const CLOSED_RUN_MEMORY: usize = 1024;

/// Bounded, insertion-ordered set of closed run ids.
#[derive(Default)]
struct ClosedRuns {
    order: VecDeque<RunId>,
    ids: HashSet<RunId>,
}

impl ClosedRuns {
    fn insert(&mut self, run_id: &RunId) {
        if !self.ids.insert(run_id.clone()) {
            return;
        }
        self.order.push_back(run_id.clone());
        if self.order.len() > CLOSED_RUN_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, run_id: &RunId) {
        if self.ids.remove(run_id) {
            self.order.retain(|r| r != run_id);
        }
    }

    fn contains(&self, run_id: &RunId) -> bool {
        self.ids.contains(run_id)
    }
}

#[derive(Default)]
struct Subscribers {
    per_run: HashMap<RunId, Vec<Subscriber>>,
    global: Vec<Subscriber>,
    closed: ClosedRuns,
}

/// Publish/subscribe hub shared by every run of a controller.
#[derive(Default)]
pub struct ProgressBroadcaster {
    inner: Mutex<Subscribers>,
}

impl fmt::Debug for ProgressBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ProgressBroadcaster")
            .field("runs", &inner.per_run.len())
            .field("global", &inner.global.len())
            .field("closed", &inner.closed.order.len())
            .finish()
    }
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream of the future events of one run.
    ///
    /// If the run was already closed the stream ends immediately.
    pub fn subscribe(&self, run_id: &RunId) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.add(Scope::Run(run_id.clone()), Subscriber::Channel(tx)) {
            debug!(run_id = %run_id, "subscriber added");
        } else {
            debug!(run_id = %run_id, "run already closed; stream ends immediately");
        }
        EventStream { rx }
    }

    /// Stream of the future events of every run.
    pub fn subscribe_all(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add(Scope::All, Subscriber::Channel(tx));
        EventStream { rx }
    }

    /// Register a callback subscriber. `name` identifies it in logs.
    ///
    /// A sink scoped to an already closed run is dropped.
    pub fn add_sink(&self, scope: Scope, name: impl Into<String>, sink: Arc<dyn ProgressSink>) {
        let name = name.into();
        let added = self.add(
            scope,
            Subscriber::Sink {
                name: name.clone(),
                sink,
            },
        );
        if !added {
            debug!(sink = %name, "run already closed; sink dropped");
        }
    }

    /// Deliver `event` to the subscribers of its run and to global ones.
    pub fn publish(&self, event: &ProgressEvent) {
        let targets: Vec<Subscriber> = {
            let inner = self.lock();
            inner
                .per_run
                .get(&event.run_id)
                .into_iter()
                .flatten()
                .chain(inner.global.iter())
                .cloned()
                .collect()
        };

        let mut saw_closed = false;
        for target in &targets {
            match target {
                Subscriber::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        saw_closed = true;
                    }
                }
                Subscriber::Sink { name, sink } => {
                    match catch_unwind(AssertUnwindSafe(|| sink.deliver(event))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(
                            run_id = %event.run_id,
                            sink = %name,
                            sequence = event.sequence,
                            error = %e,
                            "progress sink failed"
                        ),
                        Err(_) => warn!(
                            run_id = %event.run_id,
                            sink = %name,
                            sequence = event.sequence,
                            "progress sink panicked"
                        ),
                    }
                }
            }
        }

        if saw_closed {
            self.prune();
        }
    }

    /// Drop every subscriber of `run_id`; their streams end after the
    /// events already delivered. Later subscriptions to the run end at once
    /// until [`ProgressBroadcaster::reopen`] is called for it.
    pub fn close_run(&self, run_id: &RunId) {
        let mut inner = self.lock();
        inner.closed.insert(run_id);
        if inner.per_run.remove(run_id).is_some() {
            debug!(run_id = %run_id, "run subscribers closed");
        }
    }

    /// Forget that `run_id` was closed, so it can be subscribed to again.
    pub fn reopen(&self, run_id: &RunId) {
        self.lock().closed.remove(run_id);
    }

    /// Drop the current subscribers of `run_id` without marking it closed.
    pub(crate) fn discard_subscribers(&self, run_id: &RunId) {
        if self.lock().per_run.remove(run_id).is_some() {
            debug!(run_id = %run_id, "run subscribers discarded");
        }
    }

    pub fn is_closed(&self, run_id: &RunId) -> bool {
        self.lock().closed.contains(run_id)
    }

    /// Number of live subscribers for a run, global ones excluded.
    pub fn subscriber_count(&self, run_id: &RunId) -> usize {
        self.lock()
            .per_run
            .get(run_id)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Returns `false` (dropping the subscriber) if the run is closed.
    fn add(&self, scope: Scope, subscriber: Subscriber) -> bool {
        let mut inner = self.lock();
        match scope {
            Scope::Run(run_id) => {
                if inner.closed.contains(&run_id) {
                    return false;
                }
                inner.per_run.entry(run_id).or_default().push(subscriber);
            }
            Scope::All => inner.global.push(subscriber),
        }
        true
    }

    fn prune(&self) {
        let mut inner = self.lock();
        inner.global.retain(|s| !s.is_closed());
        inner.per_run.retain(|_, subs| {
            subs.retain(|s| !s.is_closed());
            !subs.is_empty()
        });
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl EventStream {
    /// A stream that yields nothing.
    pub(crate) fn closed() -> Self {
        let (_, rx) = mpsc::unbounded_channel();
        Self { rx }
    }

    /// Next event, or `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
