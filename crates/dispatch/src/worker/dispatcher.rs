//! Bounded-concurrency dispatcher
//!
//! Drains a source channel, running one handler per item while keeping the
//! number of running handlers at or below a ceiling. One control loop
//! reacts to a tick, handler completions and new items:
//!
//! ```text
//!  source ──item──▶ ┌──────────────┐ ──spawn──▶ handler ─┐
//!                   │ control loop │                     │
//!  tick ──────────▶ │ (select!)    │ ◀──completion───────┘
//!                   └──────┬───────┘
//!                          ▼
//!                  BackpressureFlag (pause / unpause)
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::backpressure::{BackpressureFlag, InFlightCounter};
use crate::config::duration_millis;
use crate::metrics;
use crate::model::Asset;
use crate::stream::StreamMessage;

/// A unit of work the dispatcher can hand to a handler
pub trait WorkItem: Send + 'static {
    /// Empty items are skipped without running the handler
    fn is_empty(&self) -> bool;

    /// Short description for logs
    fn describe(&self) -> String;
}

impl WorkItem for Asset {
    fn is_empty(&self) -> bool {
        Asset::is_empty(self)
    }

    fn describe(&self) -> String {
        self.id.to_string()
    }
}

impl WorkItem for StreamMessage {
    // Every delivery needs a disposition, so none are skipped.
    fn is_empty(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        format!("{}#{}", self.subject(), self.delivery_count())
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Ceiling on concurrently running handlers
    pub max_concurrency: usize,

    /// Control loop tick
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl DispatcherConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }
}

/// Counts from one dispatcher run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub dispatched: usize,
    pub completed: usize,
    pub skipped: usize,
    /// Times the backpressure flag was raised
    pub pauses: usize,
}

// Signals completion when the handler task ends, including by panic.
struct CompletionGuard(mpsc::UnboundedSender<()>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// Runs handlers for source items under a concurrency ceiling
///
/// The in-flight counter and backpressure flag belong to the dispatcher;
/// producers get handles through [`counter`](Self::counter) and
/// [`flag`](Self::flag).
pub struct BoundedDispatcher {
    config: DispatcherConfig,
    counter: InFlightCounter,
    flag: BackpressureFlag,
    path: &'static str,
}

impl BoundedDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            counter: InFlightCounter::new(config.max_concurrency),
            flag: BackpressureFlag::new(),
            path: "bulk",
            config,
        }
    }

    /// Label used on metrics ("bulk" or "events")
    pub fn with_path(mut self, path: &'static str) -> Self {
        self.path = path;
        self
    }

    pub fn flag(&self) -> BackpressureFlag {
        self.flag.clone()
    }

    pub fn counter(&self) -> InFlightCounter {
        self.counter.clone()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Dispatch until the source is exhausted and every handler finished
    ///
    /// Cancellation stops taking new items; handlers already running are
    /// awaited. Handler failures are the handler's business.
    pub async fn run<T, F, Fut>(
        &self,
        mut source: mpsc::Receiver<T>,
        cancel: CancellationToken,
        handler: F,
    ) -> DispatchSummary
    where
        T: WorkItem,
        F: Fn(T) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut summary = DispatchSummary::default();
        let mut exhausted = false;

        loop {
            if exhausted && self.counter.current() == 0 {
                break;
            }

            let accepting = !exhausted && !cancel.is_cancelled() && !self.counter.is_saturated();

            tokio::select! {
                _ = ticker.tick() => self.on_tick(&mut summary),

                Some(()) = done_rx.recv() => {
                    let in_flight = self.counter.decrement();
                    summary.completed += 1;
                    metrics::task_completed(self.path);
                    metrics::queue_depth(self.path, in_flight);
                }

                item = source.recv(), if accepting => match item {
                    None => {
                        debug!(path = self.path, "source exhausted");
                        exhausted = true;
                    }
                    Some(item) if item.is_empty() => {
                        trace!(path = self.path, "skipping empty item");
                        summary.skipped += 1;
                    }
                    Some(item) => {
                        let in_flight = self.counter.increment();
                        summary.dispatched += 1;
                        metrics::task_dispatched(self.path);
                        metrics::queue_depth(self.path, in_flight);
                        trace!(path = self.path, item = %item.describe(), in_flight, "dispatching");

                        let guard = CompletionGuard(done_tx.clone());
                        let work = handler(item);
                        tokio::spawn(async move {
                            let _guard = guard;
                            work.await;
                        });
                    }
                },

                _ = cancel.cancelled(), if !exhausted => {
                    info!(
                        path = self.path,
                        in_flight = self.counter.current(),
                        "dispatch cancelled, draining in-flight handlers"
                    );
                    exhausted = true;
                }
            }
        }

        self.flag.unpause();
        metrics::queue_depth(self.path, 0);
        info!(
            path = self.path,
            dispatched = summary.dispatched,
            completed = summary.completed,
            skipped = summary.skipped,
            pauses = summary.pauses,
            "dispatcher finished"
        );
        summary
    }

    fn on_tick(&self, summary: &mut DispatchSummary) {
        let in_flight = self.counter.current();
        if in_flight >= self.counter.ceiling() {
            if self.flag.pause() {
                summary.pauses += 1;
                metrics::backpressure_paused(self.path);
                debug!(path = self.path, in_flight, "backpressure on");
            }
        } else if self.flag.unpause() {
            debug!(path = self.path, in_flight, "backpressure off");
        }
        metrics::queue_depth(self.path, in_flight);
    }
}
