//! # Inventory Dispatch Engine
//!
//! Coordinates hardware inventory collection across a fleet of workers.
//!
//! ## Features
//!
//! - **Paged enumeration**: Walks the inventory store page by page, pausing under backpressure
//! - **Bounded dispatch**: One dispatcher caps concurrent collections for both bulk and event paths
//! - **Distributed task ledger**: Revisioned key-value records let workers claim and reclaim tasks
//! - **Stream consumption**: Ack, nak and in-progress decisions with heartbeats for long tasks
//! - **OpenTelemetry integration**: Traces propagated from events into ledger records
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              EventConsumer / BulkCollector                   │
//! │  (fetch events or enumerate pages, gate on backpressure)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   BoundedDispatcher                          │
//! │  (in-flight ceiling, completion signals, pause / unpause)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          TaskProcessor → TaskLedger → AssetCollector         │
//! │  (lookup, state machine, device queries, store update)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use inventory_dispatch::prelude::*;
//!
//! let config = WorkerConfig::from_env()?;
//! let ledger = TaskLedger::new(kv, config.worker_id.clone(), config.ledger_config());
//! let collector = AssetCollector::new(device, store);
//!
//! let processor = TaskProcessor::new(ledger, collector, config.consumer_config());
//! let consumer = EventConsumer::new(stream, processor, config.dispatcher_config());
//!
//! let cancel = CancellationToken::new();
//! consumer.run(cancel.clone()).await?;
//! ```

pub mod collector;
pub mod config;
pub mod inventory;
pub mod kv;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod stream;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::collector::{AssetCollector, CollectError, CollectorError, DeviceCollector};
    pub use crate::config::{ConfigError, WorkerConfig};
    pub use crate::inventory::{InMemoryInventoryStore, InventoryStore, StoreError};
    pub use crate::kv::{InMemoryKeyValueStore, KeyValueStore, KvError, PostgresKeyValueStore};
    pub use crate::ledger::{LedgerConfig, LedgerError, LedgerStatus, TaskLedger};
    pub use crate::model::{Asset, Task, TaskRequest, TaskState};
    pub use crate::stream::{Disposition, EventStream, InMemoryEventStream, StreamMessage};
    pub use crate::telemetry::{init_telemetry, TelemetryConfig, TraceContext};
    pub use crate::worker::{
        BoundedDispatcher, BulkCollector, ConsumerConfig, DispatcherConfig, EventConsumer,
        PagedAssetSource, SourceConfig, TaskProcessor,
    };
    pub use tokio_util::sync::CancellationToken;
}

// Re-export key types at crate root
pub use collector::{AssetCollector, CollectError, CollectorError, DeviceCollector};
pub use config::{ConfigError, WorkerConfig};
pub use inventory::{InventoryStore, StoreError};
pub use kv::{KeyValueStore, KvError};
pub use ledger::{LedgerRecord, LedgerStatus, TaskLedger};
pub use model::{Asset, Task, TaskRequest, TaskState};
pub use stream::{Disposition, EventStream, StreamMessage};
pub use telemetry::TraceContext;
pub use worker::{BackpressureFlag, BoundedDispatcher, BulkCollector, EventConsumer};
