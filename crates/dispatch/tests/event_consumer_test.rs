//! Event-driven collection against in-memory backends
//!
//! Run with: cargo test -p inventory-dispatch --test event_consumer_test

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use inventory_dispatch::collector::{AssetCollector, ScriptedCollector};
use inventory_dispatch::inventory::{InMemoryInventoryStore, StoreError};
use inventory_dispatch::kv::{InMemoryKeyValueStore, KeyValueStore};
use inventory_dispatch::ledger::{LedgerConfig, LedgerStatus, TaskLedger};
use inventory_dispatch::model::{ledger_key, CollectionMethod, Task, TaskRequest, TaskState};
use inventory_dispatch::stream::{
    Disposition, EventStream, InMemoryEventStream, StreamError, StreamMessage,
};
use inventory_dispatch::telemetry::TraceContext;
use inventory_dispatch::worker::{
    ConsumerConfig, ConsumerError, DispatcherConfig, EventConsumer, TaskProcessor,
};

const FACILITY: &str = "sandbox";

struct Harness {
    store: Arc<InMemoryInventoryStore>,
    device: ScriptedCollector,
    kv: Arc<InMemoryKeyValueStore>,
    stream: InMemoryEventStream,
}

impl Harness {
    fn new(assets: usize) -> Self {
        Self {
            store: Arc::new(InMemoryInventoryStore::with_generated_assets(assets, FACILITY)),
            device: ScriptedCollector::new(),
            kv: Arc::new(InMemoryKeyValueStore::new("inventory-tasks")),
            stream: InMemoryEventStream::new(Duration::from_secs(30)),
        }
    }

    fn ledger(&self, worker_id: &str) -> TaskLedger {
        TaskLedger::new(self.kv.clone(), worker_id, LedgerConfig::default())
    }

    fn processor(&self, config: ConsumerConfig) -> TaskProcessor {
        let collector = AssetCollector::new(Arc::new(self.device.clone()), self.store.clone());
        TaskProcessor::new(self.ledger("worker-a"), collector, config)
    }

    fn publish(&self, request: &TaskRequest) -> u64 {
        self.stream
            .publish(format!("{FACILITY}.inventory"), request.to_vec().unwrap())
    }

    async fn next_message(&self) -> StreamMessage {
        self.stream
            .fetch(1, Duration::ZERO)
            .await
            .unwrap()
            .pop()
            .expect("a pending message")
    }
}

fn total_deliveries(stream: &InMemoryEventStream, sequences: &[u64]) -> u64 {
    sequences.iter().map(|s| stream.deliveries(*s)).sum()
}

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig::default()
        .with_fetch_wait(Duration::from_secs(1))
        .with_heartbeat_interval(Duration::from_secs(10))
        .with_task_timeout(Duration::from_secs(60))
}

#[tokio::test]
async fn test_new_task_is_collected_and_acked() {
    let harness = Harness::new(1);
    let asset_id = harness.store.asset_ids()[0];
    let request = TaskRequest::new(FACILITY, asset_id).with_bios_configuration();
    let sequence = harness.publish(&request);

    let processor = harness.processor(consumer_config());
    let disposition = processor.process(harness.next_message().await).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(harness.stream.dispositions(sequence), vec![Disposition::Ack]);

    let stored = harness.store.updated_asset(asset_id).unwrap();
    assert!(stored.inventory.is_some());
    assert!(stored.bios_configuration.is_some());

    match processor.ledger().lookup(request.id, FACILITY).await {
        LedgerStatus::Complete { record } => {
            assert_eq!(record.state, TaskState::Succeeded);
            assert_eq!(record.worker_id, "worker-a");
            assert_eq!(record.target, asset_id);
        }
        other => panic!("expected a complete record, got {other}"),
    }
}

#[tokio::test]
async fn test_inband_task_uses_inband_collector_without_credentials() {
    let harness = Harness::new(2);
    let inband = ScriptedCollector::new();
    let collector = AssetCollector::new(Arc::new(harness.device.clone()), harness.store.clone())
        .with_inband(Arc::new(inband.clone()));
    let processor = TaskProcessor::new(harness.ledger("worker-a"), collector, consumer_config());

    let ids = harness.store.asset_ids();
    let local = TaskRequest::new(FACILITY, ids[0]).with_method(CollectionMethod::Inband);
    harness.publish(&local);
    assert_eq!(
        processor.process(harness.next_message().await).await,
        Disposition::Ack
    );
    assert_eq!(inband.inventory_calls(), 1);
    assert_eq!(inband.credentialed_calls(), 0);
    assert_eq!(harness.device.inventory_calls(), 0);

    let remote = TaskRequest::new(FACILITY, ids[1]);
    harness.publish(&remote);
    assert_eq!(
        processor.process(harness.next_message().await).await,
        Disposition::Ack
    );
    assert_eq!(harness.device.inventory_calls(), 1);
    assert_eq!(harness.device.credentialed_calls(), 1);
    assert_eq!(harness.store.updated_count(), 2);
}

#[tokio::test]
async fn test_inband_task_without_inband_collector_fails_permanently() {
    let harness = Harness::new(1);
    let request =
        TaskRequest::new(FACILITY, harness.store.asset_ids()[0]).with_method(CollectionMethod::Inband);
    let sequence = harness.publish(&request);

    let processor = harness.processor(consumer_config());
    let disposition = processor.process(harness.next_message().await).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(harness.stream.dispositions(sequence), vec![Disposition::Ack]);
    assert_eq!(harness.device.inventory_calls(), 0);
    match processor.ledger().lookup(request.id, FACILITY).await {
        LedgerStatus::Complete { record } => {
            assert_eq!(record.state, TaskState::Failed);
            assert!(record.status.contains("unsupported"));
        }
        other => panic!("expected a failed terminal record, got {other}"),
    }
}

#[tokio::test]
async fn test_task_in_progress_elsewhere_is_not_collected() {
    let harness = Harness::new(1);
    let request = TaskRequest::new(FACILITY, harness.store.asset_ids()[0]);

    // Another worker already claimed the task.
    let mut claimed = Task::from_request(&request);
    claimed.transition(TaskState::Active, "collecting").unwrap();
    harness.ledger("worker-b").publish(&mut claimed).await.unwrap();

    let sequence = harness.publish(&request);
    let disposition = harness
        .processor(consumer_config())
        .process(harness.next_message().await)
        .await;

    assert_eq!(disposition, Disposition::InProgress);
    assert_eq!(
        harness.stream.dispositions(sequence),
        vec![Disposition::InProgress]
    );
    assert_eq!(harness.device.inventory_calls(), 0);
    assert_eq!(harness.store.updated_count(), 0);
}

#[tokio::test]
async fn test_missing_asset_fails_permanently() {
    let harness = Harness::new(1);
    let request = TaskRequest::new(FACILITY, Uuid::now_v7());
    let sequence = harness.publish(&request);

    let processor = harness.processor(consumer_config());
    let disposition = processor.process(harness.next_message().await).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(harness.stream.dispositions(sequence), vec![Disposition::Ack]);
    assert_eq!(harness.stream.pending_count(), 0);
    assert_eq!(harness.device.inventory_calls(), 0);

    match processor.ledger().lookup(request.id, FACILITY).await {
        LedgerStatus::Complete { record } => {
            assert_eq!(record.state, TaskState::Failed);
            assert!(!record.retryable);
        }
        other => panic!("expected a failed terminal record, got {other}"),
    }
}

#[tokio::test]
async fn test_transient_failure_is_retried_on_redelivery() {
    let harness = Harness::new(1);
    let asset_id = harness.store.asset_ids()[0];
    harness
        .store
        .fail_lookup(asset_id, StoreError::Timeout("inventory api".into()), 1);
    let request = TaskRequest::new(FACILITY, asset_id);
    let sequence = harness.publish(&request);
    let processor = harness.processor(consumer_config());

    let first = processor.process(harness.next_message().await).await;
    assert_eq!(first, Disposition::Nak);

    let status = processor.ledger().lookup(request.id, FACILITY).await;
    assert!(
        matches!(&status, LedgerStatus::Orphaned { record, .. } if record.retryable),
        "retryable failure should be reclaimable, got {status}"
    );

    // Nak makes the message immediately available again.
    let redelivered = harness.next_message().await;
    assert_eq!(redelivered.delivery_count(), 2);
    let second = processor.process(redelivered).await;

    assert_eq!(second, Disposition::Ack);
    assert_eq!(
        harness.stream.dispositions(sequence),
        vec![Disposition::Nak, Disposition::Ack]
    );
    assert!(matches!(
        processor.ledger().lookup(request.id, FACILITY).await,
        LedgerStatus::Complete { record } if record.state == TaskState::Succeeded
    ));
}

#[tokio::test]
async fn test_crashed_worker_task_is_reclaimed() {
    let harness = Harness::new(1);
    let asset_id = harness.store.asset_ids()[0];
    let request = TaskRequest::new(FACILITY, asset_id);

    // worker-b claimed the task and went away without finishing it.
    let mut abandoned = Task::from_request(&request);
    abandoned.transition(TaskState::Active, "collecting").unwrap();
    let claimed_at = harness.ledger("worker-b").publish(&mut abandoned).await.unwrap();
    harness.kv.backdate(
        &ledger_key(FACILITY, request.id),
        Duration::from_secs(11 * 60),
    );

    let sequence = harness.publish(&request);
    let processor = harness.processor(consumer_config());
    let disposition = processor.process(harness.next_message().await).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(harness.stream.dispositions(sequence), vec![Disposition::Ack]);
    assert_eq!(harness.device.inventory_calls(), 1);
    assert!(harness.store.updated_asset(asset_id).is_some());

    let entry = harness
        .kv
        .get(&ledger_key(FACILITY, request.id))
        .await
        .unwrap()
        .unwrap();
    assert!(entry.revision > claimed_at);
    match processor.ledger().lookup(request.id, FACILITY).await {
        LedgerStatus::Complete { record } => {
            assert_eq!(record.state, TaskState::Succeeded);
            assert_eq!(record.worker_id, "worker-a");
        }
        other => panic!("expected a complete record, got {other}"),
    }
}

#[tokio::test]
async fn test_request_for_other_facility_is_dropped() {
    let harness = Harness::new(1);
    let request = TaskRequest::new("sjc1", harness.store.asset_ids()[0]);
    let sequence = harness
        .stream
        .publish("sjc1.inventory", request.to_vec().unwrap());

    let processor = harness.processor(consumer_config().with_facility(FACILITY));
    let disposition = processor.process(harness.next_message().await).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(harness.stream.dispositions(sequence), vec![Disposition::Ack]);
    assert_eq!(harness.device.inventory_calls(), 0);
    assert!(harness.kv.is_empty());
}

#[tokio::test]
async fn test_malformed_payload_is_dropped() {
    let harness = Harness::new(0);
    let sequence = harness
        .stream
        .publish(format!("{FACILITY}.inventory"), b"not json".to_vec());

    let disposition = harness
        .processor(consumer_config())
        .process(harness.next_message().await)
        .await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(harness.stream.dispositions(sequence), vec![Disposition::Ack]);
    assert!(harness.kv.is_empty());
}

#[tokio::test]
async fn test_unreachable_ledger_releases_message() {
    let harness = Harness::new(1);
    let request = TaskRequest::new(FACILITY, harness.store.asset_ids()[0]);
    let sequence = harness.publish(&request);
    harness.kv.fail_with("bucket unavailable");

    let disposition = harness
        .processor(consumer_config())
        .process(harness.next_message().await)
        .await;

    assert_eq!(disposition, Disposition::Nak);
    assert_eq!(harness.stream.dispositions(sequence), vec![Disposition::Nak]);
    assert_eq!(harness.device.inventory_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hung_collection_hits_deadline() {
    let harness = Harness::new(1);
    let asset_id = harness.store.asset_ids()[0];
    harness.device.hang(asset_id);
    let request = TaskRequest::new(FACILITY, asset_id);
    let sequence = harness.publish(&request);

    let processor = harness.processor(consumer_config());
    let disposition = processor.process(harness.next_message().await).await;

    assert_eq!(disposition, Disposition::Ack);
    let log = harness.stream.dispositions(sequence);
    assert_eq!(log.last(), Some(&Disposition::Ack));
    assert!(log[..log.len() - 1]
        .iter()
        .all(|d| *d == Disposition::InProgress));

    match processor.ledger().lookup(request.id, FACILITY).await {
        LedgerStatus::Complete { record } => {
            assert_eq!(record.state, TaskState::Failed);
            assert!(record.status.contains("deadline"));
        }
        other => panic!("expected a failed terminal record, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_long_collection_is_kept_alive() {
    let mut harness = Harness::new(1);
    harness.device = ScriptedCollector::new().with_delay(Duration::from_secs(45));
    let request = TaskRequest::new(FACILITY, harness.store.asset_ids()[0]);
    let sequence = harness.publish(&request);

    let disposition = harness
        .processor(consumer_config())
        .process(harness.next_message().await)
        .await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(harness.stream.deliveries(sequence), 1);
    let log = harness.stream.dispositions(sequence);
    assert!(log.iter().filter(|d| **d == Disposition::InProgress).count() >= 3);
    assert_eq!(log.last(), Some(&Disposition::Ack));
}

#[tokio::test]
async fn test_trace_context_reaches_ledger_record() {
    let harness = Harness::new(1);
    let request = TaskRequest::new(FACILITY, harness.store.asset_ids()[0]);
    let trace = TraceContext::from_traceparent(
        "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
    )
    .unwrap();
    harness.stream.publish_with_trace(
        format!("{FACILITY}.inventory"),
        request.to_vec().unwrap(),
        Some(trace.clone()),
    );

    let processor = harness.processor(consumer_config());
    processor.process(harness.next_message().await).await;

    match processor.ledger().lookup(request.id, FACILITY).await {
        LedgerStatus::Complete { record } => {
            assert_eq!(record.trace_id.as_deref(), Some(trace.trace_id.as_str()));
        }
        other => panic!("expected a complete record, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_consumer_drains_stream_within_ceiling() {
    let harness = Harness::new(12);
    let device = ScriptedCollector::new().with_delay(Duration::from_secs(2));
    let collector = AssetCollector::new(Arc::new(device.clone()), harness.store.clone());
    let processor = TaskProcessor::new(
        harness.ledger("worker-a"),
        collector,
        consumer_config().with_fetch_batch_size(4),
    );

    let sequences: Vec<u64> = harness
        .store
        .asset_ids()
        .into_iter()
        .map(|id| harness.publish(&TaskRequest::new(FACILITY, id)))
        .collect();

    let consumer = Arc::new(EventConsumer::new(
        Arc::new(harness.stream.clone()),
        processor,
        DispatcherConfig::default()
            .with_max_concurrency(3)
            .with_tick_interval(Duration::from_millis(100)),
    ));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        async move { consumer.run(cancel).await }
    });

    for _ in 0..600 {
        if harness.stream.pending_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    cancel.cancel();
    let summary = handle.await.unwrap().unwrap();

    assert_eq!(harness.stream.pending_count(), 0);
    assert_eq!(summary.completed, 12);
    assert!(device.peak_concurrency() <= 3);
    for sequence in sequences {
        assert_eq!(harness.stream.dispositions(sequence), vec![Disposition::Ack]);
    }
    assert_eq!(harness.store.updated_count(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_consumer_holds_no_messages_beyond_ceiling() {
    let harness = Harness::new(6);
    let device = ScriptedCollector::new().with_delay(Duration::from_secs(120));
    let collector = AssetCollector::new(Arc::new(device.clone()), harness.store.clone());
    let processor = TaskProcessor::new(
        harness.ledger("worker-a"),
        collector,
        consumer_config().with_fetch_batch_size(2),
    );

    let sequences: Vec<u64> = harness
        .store
        .asset_ids()
        .into_iter()
        .map(|id| harness.publish(&TaskRequest::new(FACILITY, id)))
        .collect();

    let consumer = Arc::new(EventConsumer::new(
        Arc::new(harness.stream.clone()),
        processor,
        DispatcherConfig::default()
            .with_max_concurrency(1)
            .with_tick_interval(Duration::from_millis(100)),
    ));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        async move { consumer.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(total_deliveries(&harness.stream, &sequences), 1);

    // Past two ack waits: nothing was fetched and left to expire.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(total_deliveries(&harness.stream, &sequences), 1);
    let running: Vec<_> = sequences
        .iter()
        .filter(|s| harness.stream.deliveries(**s) == 1)
        .collect();
    assert_eq!(running.len(), 1);
    assert!(harness
        .stream
        .dispositions(*running[0])
        .iter()
        .all(|d| *d == Disposition::InProgress));

    cancel.cancel();
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(
        harness.stream.dispositions(*running[0]).last(),
        Some(&Disposition::Ack)
    );
    assert_eq!(harness.stream.pending_count(), 5);
    assert_eq!(device.peak_concurrency(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_consumer_survives_fetch_errors() {
    let harness = Harness::new(1);
    harness.stream.fail_fetches(3);
    let sequence = harness.publish(&TaskRequest::new(FACILITY, harness.store.asset_ids()[0]));

    let consumer = EventConsumer::new(
        Arc::new(harness.stream.clone()),
        harness.processor(consumer_config()),
        DispatcherConfig::default(),
    );
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    let stream = harness.stream.clone();
    let watcher = tokio::spawn(async move {
        while stream.pending_count() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        stopper.cancel();
    });

    let summary = consumer.run(cancel).await.unwrap();
    watcher.await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(harness.stream.dispositions(sequence), vec![Disposition::Ack]);
}

#[tokio::test]
async fn test_consumer_refuses_to_start_without_subscription() {
    let harness = Harness::new(0);
    harness
        .stream
        .fail_verify(StreamError::SubscriptionNotFound("inventory".into()));

    let consumer = EventConsumer::new(
        Arc::new(harness.stream.clone()),
        harness.processor(consumer_config()),
        DispatcherConfig::default(),
    );

    let err = consumer.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err,
        ConsumerError::Verify(StreamError::SubscriptionNotFound(_))
    ));
}

#[tokio::test]
async fn test_ledger_is_shared_between_workers() {
    let harness = Harness::new(1);
    let request = TaskRequest::new(FACILITY, harness.store.asset_ids()[0]);
    harness.publish(&request);
    harness
        .processor(consumer_config())
        .process(harness.next_message().await)
        .await;

    // A different worker sees the finished task through the same bucket.
    let other = harness.ledger("worker-b");
    assert!(matches!(
        other.lookup(request.id, FACILITY).await,
        LedgerStatus::Complete { .. }
    ));
    assert_eq!(harness.kv.keys(FACILITY).await.unwrap().len(), 1);
}
