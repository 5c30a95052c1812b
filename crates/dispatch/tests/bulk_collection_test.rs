//! Bulk collection over the whole inventory
//!
//! Run with: cargo test -p inventory-dispatch --test bulk_collection_test

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use inventory_dispatch::collector::{AssetCollector, ScriptedCollector};
use inventory_dispatch::config::WorkerConfig;
use inventory_dispatch::inventory::InMemoryInventoryStore;
use inventory_dispatch::ledger::{LedgerConfig, TaskLedger};
use inventory_dispatch::model::TaskState;
use inventory_dispatch::worker::{BulkCollector, DispatcherConfig, SourceConfig};

fn bulk_collector(
    store: Arc<InMemoryInventoryStore>,
    device: ScriptedCollector,
    page_size: usize,
) -> BulkCollector {
    BulkCollector::new(
        AssetCollector::new(Arc::new(device), store),
        SourceConfig::default().with_page_size(page_size),
        DispatcherConfig::default()
            .with_max_concurrency(2)
            .with_tick_interval(Duration::from_millis(100)),
    )
}

#[test_log::test(tokio::test)]
async fn test_empty_inventory_dispatches_nothing() {
    let store = Arc::new(InMemoryInventoryStore::new());
    let device = ScriptedCollector::new();

    let summary = bulk_collector(store.clone(), device.clone(), 10)
        .run(CancellationToken::new())
        .await;

    assert_eq!(summary.source.total, Some(0));
    assert_eq!(summary.source.emitted, 0);
    assert_eq!(summary.dispatch.dispatched, 0);
    assert_eq!(summary.dispatch.completed, 0);
    assert_eq!(store.page_fetches(), 1);
    assert_eq!(device.inventory_calls(), 0);
}

#[test_log::test(tokio::test)]
async fn test_small_inventory_ends_with_succeeded_records() {
    let store = Arc::new(InMemoryInventoryStore::with_generated_assets(3, "sandbox"));
    let device = ScriptedCollector::new();
    let ledger = TaskLedger::in_memory("worker-a", LedgerConfig::default());

    let summary = bulk_collector(store.clone(), device.clone(), 10)
        .with_ledger(ledger.clone())
        .run(CancellationToken::new())
        .await;

    assert_eq!(summary.dispatch.dispatched, 3);
    assert_eq!(summary.dispatch.completed, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(device.inventory_calls(), 3);
    assert_eq!(store.page_fetches(), 1);

    let records = ledger.records("sandbox").await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|r| r.state == TaskState::Succeeded && r.is_complete()));

    let mut targets: Vec<_> = records.iter().map(|r| r.target).collect();
    let mut expected = store.asset_ids();
    targets.sort();
    expected.sort();
    assert_eq!(targets, expected);
}

#[tokio::test(start_paused = true)]
async fn test_configured_worker_collects_many_pages() {
    let config = WorkerConfig::new("sandbox")
        .with_page_size(7)
        .with_max_concurrency(4)
        .with_tick_interval(Duration::from_millis(50));
    let store = Arc::new(InMemoryInventoryStore::with_generated_assets(50, "sandbox"));
    let device = ScriptedCollector::new().with_delay(Duration::from_millis(300));

    let summary = BulkCollector::new(
        AssetCollector::new(Arc::new(device.clone()), store.clone()),
        config.source_config(),
        config.dispatcher_config(),
    )
    .run(CancellationToken::new())
    .await;

    assert_eq!(summary.source.pages_fetched, 8);
    assert_eq!(summary.dispatch.completed, 50);
    assert_eq!(store.updated_count(), 50);
    assert!(device.peak_concurrency() <= 4);
    assert!(summary.dispatch.pauses >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_run_finishes_started_work() {
    let store = Arc::new(InMemoryInventoryStore::with_generated_assets(40, "sandbox"));
    let device = ScriptedCollector::new().with_delay(Duration::from_secs(1));
    let collector = bulk_collector(store.clone(), device.clone(), 5);

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        stopper.cancel();
    });

    let summary = collector.run(cancel).await;

    assert!(summary.dispatch.dispatched < 40);
    assert_eq!(summary.dispatch.completed, summary.dispatch.dispatched);
    assert_eq!(store.updated_count(), summary.dispatch.completed);
}
