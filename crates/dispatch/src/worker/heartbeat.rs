//! Heartbeats for long-running event-driven collections
//!
//! While a task executes, the monitor periodically tells the stream the
//! message is still being worked on and refreshes the task's ledger record
//! so other workers keep seeing it as in progress.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::ledger::TaskLedger;
use crate::metrics;
use crate::model::Task;
use crate::stream::StreamMessage;

/// Keeps a message and its ledger record alive during execution
pub struct HeartbeatMonitor<'a> {
    message: &'a StreamMessage,
    ledger: &'a TaskLedger,
    interval: Duration,
}

impl<'a> HeartbeatMonitor<'a> {
    pub fn new(message: &'a StreamMessage, ledger: &'a TaskLedger, interval: Duration) -> Self {
        Self {
            message,
            ledger,
            interval,
        }
    }

    /// Drive `work` to completion, beating every interval until it finishes
    ///
    /// The first beat happens one interval after the start. Returns the
    /// work's output and the number of beats sent.
    pub async fn supervise<W>(&self, task: &mut Task, work: W) -> (W::Output, usize)
    where
        W: Future,
    {
        tokio::pin!(work);
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut beats = 0;

        loop {
            tokio::select! {
                biased;
                output = &mut work => return (output, beats),
                _ = ticker.tick() => {
                    beats += 1;
                    self.beat(task).await;
                }
            }
        }
    }

    /// Send one heartbeat; failures are logged and counted
    pub async fn beat(&self, task: &mut Task) {
        if let Err(e) = self.message.in_progress().await {
            warn!(task_id = %task.id, error = %e, "in-progress acknowledgement failed");
            metrics::stream_error("in_progress");
        }

        match self.ledger.publish(task).await {
            Ok(revision) => debug!(task_id = %task.id, revision, "heartbeat"),
            Err(e) => warn!(task_id = %task.id, error = %e, "heartbeat ledger refresh failed"),
        }
    }
}
