//! One-shot collection over the whole inventory
//!
//! Wires a [`PagedAssetSource`] into a [`BoundedDispatcher`] whose handler
//! runs [`AssetCollector::collect_bulk`] for each asset. With a ledger
//! attached, every asset is also recorded as a task so other workers and
//! operators can see its outcome.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::consumer::AckPolicy;
use super::dispatcher::{BoundedDispatcher, DispatchSummary, DispatcherConfig};
use super::source::{PagedAssetSource, SourceConfig, SourceSummary};
use crate::collector::AssetCollector;
use crate::ledger::TaskLedger;
use crate::model::{Asset, Task, TaskState};

/// Outcome of one bulk run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub source: SourceSummary,
    pub dispatch: DispatchSummary,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Tally {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

/// Collects every asset of the inventory store once
pub struct BulkCollector {
    collector: AssetCollector,
    ledger: Option<TaskLedger>,
    source_config: SourceConfig,
    dispatcher: BoundedDispatcher,
    bios_configuration: bool,
}

impl BulkCollector {
    pub fn new(
        collector: AssetCollector,
        source_config: SourceConfig,
        dispatcher_config: DispatcherConfig,
    ) -> Self {
        Self {
            collector,
            ledger: None,
            source_config,
            dispatcher: BoundedDispatcher::new(dispatcher_config).with_path("bulk"),
            bios_configuration: false,
        }
    }

    /// Record each asset as a task in `ledger`
    pub fn with_ledger(mut self, ledger: TaskLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Also collect BIOS configuration
    pub fn with_bios_configuration(mut self) -> Self {
        self.bios_configuration = true;
        self
    }

    pub fn dispatcher(&self) -> &BoundedDispatcher {
        &self.dispatcher
    }

    /// Enumerate and collect until the inventory is exhausted or `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> BulkSummary {
        let source = PagedAssetSource::new(
            self.collector.store().clone(),
            self.dispatcher.flag(),
            self.source_config.clone(),
        );
        let (tx, rx) = mpsc::channel(self.source_config.page_size.max(1));

        let tally = Arc::new(Tally::default());
        let collector = self.collector.clone();
        let ledger = self.ledger.clone();
        let bios_configuration = self.bios_configuration;
        let handler_tally = tally.clone();

        let (source_summary, dispatch_summary) = tokio::join!(
            source.run(tx, cancel.clone()),
            self.dispatcher.run(rx, cancel, move |asset: Asset| {
                let collector = collector.clone();
                let ledger = ledger.clone();
                let tally = handler_tally.clone();
                async move {
                    let succeeded =
                        collect_one(&collector, ledger.as_ref(), asset, bios_configuration).await;
                    let counter = if succeeded {
                        &tally.succeeded
                    } else {
                        &tally.failed
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
        );

        let summary = BulkSummary {
            source: source_summary,
            dispatch: dispatch_summary,
            succeeded: tally.succeeded.load(Ordering::Relaxed),
            failed: tally.failed.load(Ordering::Relaxed),
        };
        info!(
            total = ?summary.source.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "bulk collection finished"
        );
        summary
    }
}

async fn collect_one(
    collector: &AssetCollector,
    ledger: Option<&TaskLedger>,
    asset: Asset,
    bios_configuration: bool,
) -> bool {
    let mut task = Task::for_asset(asset, bios_configuration);
    if task.transition(TaskState::Active, "collecting").is_ok() {
        publish(ledger, &mut task).await;
    }

    let result = collector
        .collect_bulk(&mut task.asset, bios_configuration)
        .await;
    let outcome = AckPolicy::for_outcome(&result);
    if let Err(e) = &result {
        warn!(asset_id = %task.asset.id, error = %e, "bulk collection failed");
    }

    task.asset.credentials = None;
    if task.transition(outcome.state, outcome.status).is_ok() {
        task.retryable = outcome.retryable;
        publish(ledger, &mut task).await;
    }
    result.is_ok()
}

async fn publish(ledger: Option<&TaskLedger>, task: &mut Task) {
    if let Some(ledger) = ledger {
        if let Err(e) = ledger.publish(task).await {
            warn!(task_id = %task.id, error = %e, "ledger publish failed, continuing");
        }
    }
}
