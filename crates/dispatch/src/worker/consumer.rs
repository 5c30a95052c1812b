//! Event-driven collection
//!
//! The [`EventConsumer`] pulls task events from the stream into the shared
//! dispatcher. For each message the [`TaskProcessor`] consults the ledger,
//! runs the task state machine and applies the disposition chosen by
//! [`AckPolicy`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backpressure::InFlightCounter;
use super::dispatcher::{BoundedDispatcher, DispatchSummary, DispatcherConfig};
use super::heartbeat::HeartbeatMonitor;
use crate::collector::{AssetCollector, CollectError};
use crate::config::duration_millis;
use crate::ledger::{LedgerStatus, TaskLedger};
use crate::metrics;
use crate::model::{Asset, CollectionMethod, Task, TaskRequest, TaskState};
use crate::stream::{Disposition, EventStream, StreamError, StreamMessage};

/// Consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerConfig {
    /// Only requests for this facility are run; others are dropped
    pub facility: Option<String>,

    /// Messages pulled per fetch, capped by free dispatcher slots
    pub fetch_batch_size: usize,

    /// How long one fetch waits for messages
    #[serde(with = "duration_millis")]
    pub fetch_wait: Duration,

    /// Hard deadline for one task, asset lookup included
    #[serde(with = "duration_millis")]
    pub task_timeout: Duration,

    /// Cadence of in-progress acknowledgements; shorter than the ack wait
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Pause between checks while the dispatcher is saturated
    #[serde(with = "duration_millis")]
    pub gate_poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            facility: None,
            fetch_batch_size: 5,
            fetch_wait: Duration::from_secs(5),
            task_timeout: Duration::from_secs(180 * 60),
            heartbeat_interval: Duration::from_secs(3 * 60),
            gate_poll_interval: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    pub fn with_facility(mut self, facility: impl Into<String>) -> Self {
        self.facility = Some(facility.into());
        self
    }

    pub fn with_fetch_batch_size(mut self, size: usize) -> Self {
        self.fetch_batch_size = size.max(1);
        self
    }

    pub fn with_fetch_wait(mut self, wait: Duration) -> Self {
        self.fetch_wait = wait;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Consumer errors
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The stream subscription is missing or unreachable at startup
    #[error("stream subscription check failed: {0}")]
    Verify(#[source] StreamError),
}

/// What to do with a message after the ledger lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupAction {
    /// Claim and run the task
    Execute,
    /// Apply the disposition without running anything
    Respond(Disposition),
}

/// How a finished execution is recorded and acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub state: TaskState,
    pub retryable: bool,
    pub disposition: Disposition,
    pub status: String,
}

/// Maps ledger lookups and execution results to dispositions
pub struct AckPolicy;

impl AckPolicy {
    pub fn for_lookup(status: &LedgerStatus) -> LookupAction {
        if status.is_claimable() {
            return LookupAction::Execute;
        }
        let disposition = match status {
            LedgerStatus::Complete { .. } => Disposition::Ack,
            LedgerStatus::Indeterminate { .. } => Disposition::Nak,
            _ => Disposition::InProgress,
        };
        LookupAction::Respond(disposition)
    }

    /// Transient store failures are released for redelivery; everything
    /// else is final.
    pub fn for_outcome<T>(result: &Result<T, CollectError>) -> Outcome {
        match result {
            Ok(_) => Outcome {
                state: TaskState::Succeeded,
                retryable: false,
                disposition: Disposition::Ack,
                status: "collected".to_string(),
            },
            Err(e) if e.is_retryable() => Outcome {
                state: TaskState::Failed,
                retryable: true,
                disposition: Disposition::Nak,
                status: e.to_string(),
            },
            Err(e) => Outcome {
                state: TaskState::Failed,
                retryable: false,
                disposition: Disposition::Ack,
                status: e.to_string(),
            },
        }
    }
}

/// Handles one stream message end to end
pub struct TaskProcessor {
    ledger: TaskLedger,
    collector: AssetCollector,
    config: ConsumerConfig,
}

impl TaskProcessor {
    pub fn new(ledger: TaskLedger, collector: AssetCollector, config: ConsumerConfig) -> Self {
        Self {
            ledger,
            collector,
            config,
        }
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    /// Process a message and apply its disposition
    ///
    /// Returns the disposition that was applied (or attempted).
    #[instrument(skip_all, fields(subject = %message.subject(), delivery = message.delivery_count()))]
    pub async fn process(&self, message: StreamMessage) -> Disposition {
        let request = match TaskRequest::from_slice(message.payload()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping undecodable task event");
                metrics::event_rejected("malformed");
                self.respond(&message, Disposition::Ack).await;
                return Disposition::Ack;
            }
        };

        if let Some(facility) = &self.config.facility {
            if request.facility != *facility {
                warn!(
                    task_id = %request.id,
                    requested = %request.facility,
                    serving = %facility,
                    "dropping task event for another facility"
                );
                metrics::event_rejected("foreign_facility");
                self.respond(&message, Disposition::Ack).await;
                return Disposition::Ack;
            }
        }

        let status = self.ledger.lookup(request.id, &request.facility).await;
        debug!(task_id = %request.id, ledger = %status, "ledger lookup");

        if let LookupAction::Respond(disposition) = AckPolicy::for_lookup(&status) {
            self.respond(&message, disposition).await;
            return disposition;
        }

        let mut task =
            Task::from_request(&request).with_trace_context(message.trace_context().cloned());
        if let LedgerStatus::Orphaned { revision, record } = &status {
            info!(
                task_id = %task.id,
                previous_owner = %record.worker_id,
                previous_state = %record.state,
                "reclaiming orphaned task"
            );
            task = task.with_revision(*revision);
        }

        let disposition = self.execute(&mut task, &message).await;
        self.respond(&message, disposition).await;
        disposition
    }

    async fn execute(&self, task: &mut Task, message: &StreamMessage) -> Disposition {
        if let Err(e) = task.transition(TaskState::Active, "collecting") {
            error!(task_id = %task.id, error = %e, "task could not start");
            return Disposition::Nak;
        }
        self.publish(task).await;

        let asset_id = task.asset.id;
        let method = task.method;
        let bios_configuration = task.collect_bios_configuration;
        let deadline = self.config.task_timeout;
        let collector = &self.collector;

        // Only the management controller path needs credentials.
        let include_credentials = method == CollectionMethod::Outofband;
        let work = tokio::time::timeout(deadline, async move {
            let mut asset = collector
                .store()
                .asset_by_id(asset_id, include_credentials)
                .await?;
            collector
                .collect_task(&mut asset, method, bios_configuration)
                .await?;
            Ok::<Asset, CollectError>(asset)
        });

        let heartbeat = HeartbeatMonitor::new(message, &self.ledger, self.config.heartbeat_interval);
        let (result, beats) = heartbeat.supervise(task, work).await;
        let result = result.unwrap_or(Err(CollectError::DeadlineExceeded(deadline)));

        let outcome = AckPolicy::for_outcome(&result);
        match result {
            Ok(mut asset) => {
                asset.credentials = None;
                task.asset = asset;
                info!(task_id = %task.id, asset_id = %asset_id, beats, "task succeeded");
            }
            Err(e) => warn!(
                task_id = %task.id,
                asset_id = %asset_id,
                error = %e,
                retryable = outcome.retryable,
                beats,
                "task failed"
            ),
        }

        if let Err(e) = task.transition(outcome.state, outcome.status) {
            error!(task_id = %task.id, error = %e, "invalid task transition");
        }
        task.retryable = outcome.retryable;
        self.publish(task).await;

        outcome.disposition
    }

    async fn publish(&self, task: &mut Task) {
        if let Err(e) = self.ledger.publish(task).await {
            warn!(
                task_id = %task.id,
                state = %task.state(),
                error = %e,
                "ledger publish failed, continuing"
            );
        }
    }

    async fn respond(&self, message: &StreamMessage, disposition: Disposition) {
        match message.apply(disposition).await {
            Ok(()) => metrics::event_handled(disposition.as_str()),
            Err(e) => {
                warn!(%disposition, error = %e, "stream acknowledgement failed");
                metrics::stream_error(disposition.as_str());
            }
        }
    }
}

/// Pulls task events into a bounded dispatcher
pub struct EventConsumer {
    stream: Arc<dyn EventStream>,
    processor: Arc<TaskProcessor>,
    dispatcher: BoundedDispatcher,
    config: ConsumerConfig,
}

impl EventConsumer {
    pub fn new(
        stream: Arc<dyn EventStream>,
        processor: TaskProcessor,
        dispatcher_config: DispatcherConfig,
    ) -> Self {
        let config = processor.config.clone();
        Self {
            stream,
            processor: Arc::new(processor),
            dispatcher: BoundedDispatcher::new(dispatcher_config).with_path("events"),
            config,
        }
    }

    pub fn dispatcher(&self) -> &BoundedDispatcher {
        &self.dispatcher
    }

    /// Consume until cancelled, then wait for running tasks
    ///
    /// Fails only when the stream subscription cannot be verified at startup.
    pub async fn run(&self, cancel: CancellationToken) -> Result<DispatchSummary, ConsumerError> {
        self.stream.verify().await.map_err(|e| {
            error!(error = %e, "stream subscription check failed");
            ConsumerError::Verify(e)
        })?;
        info!(
            max_concurrency = self.dispatcher.config().max_concurrency,
            fetch_batch_size = self.config.fetch_batch_size,
            "event consumer started"
        );

        let ceiling = self.dispatcher.config().max_concurrency.max(1);
        let (tx, rx) = mpsc::channel(ceiling);
        let queued = InFlightCounter::new(ceiling);
        let processor = self.processor.clone();

        let fetching = self.fetch_loop(tx, queued.clone(), cancel.clone());
        let dispatching = self.dispatcher.run(rx, cancel, move |message: StreamMessage| {
            queued.decrement();
            let processor = processor.clone();
            async move {
                processor.process(message).await;
            }
        });

        let ((), summary) = tokio::join!(fetching, dispatching);
        info!(completed = summary.completed, "event consumer stopped");
        Ok(summary)
    }

    /// Fetch only as many messages as the dispatcher can start
    ///
    /// `queued` counts messages handed to the channel but not yet picked up
    /// by the dispatcher. Running plus queued never exceeds the ceiling.
    async fn fetch_loop(
        &self,
        tx: mpsc::Sender<StreamMessage>,
        queued: InFlightCounter,
        cancel: CancellationToken,
    ) {
        let counter = self.dispatcher.counter();
        let flag = self.dispatcher.flag();

        while !cancel.is_cancelled() {
            let free = counter.available().saturating_sub(queued.current());
            if free == 0 || flag.value() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.gate_poll_interval) => continue,
                }
            }

            let batch = self.config.fetch_batch_size.max(1).min(free);
            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = self.stream.fetch(batch, self.config.fetch_wait) => fetched,
            };

            match fetched {
                Ok(messages) => {
                    for message in messages {
                        queued.increment();
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "stream fetch failed");
                    metrics::stream_error("fetch");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.gate_poll_interval) => {}
                    }
                }
            }
        }
        debug!("fetch loop stopped");
    }
}
