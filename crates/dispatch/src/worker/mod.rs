//! Collection workers
//!
//! This module provides:
//! - [`BoundedDispatcher`] - Runs handlers under a concurrency ceiling
//! - [`PagedAssetSource`] - Pages through the inventory store
//! - [`BulkCollector`] - One-shot collection over the whole inventory
//! - [`EventConsumer`] - Stream-driven collection with ledger coordination
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐        ┌──────────────────────────────────────┐
//! │ PagedAssetSource │─asset─▶│                                      │
//! └────────▲─────────┘        │          BoundedDispatcher           │
//!          │ pause            │  [handler 1] [handler 2] ... [N]     │
//! ┌────────┴─────────┐        │                                      │
//! │ BackpressureFlag │◀─tick──│  in-flight counter vs. ceiling       │
//! └────────┬─────────┘        └──────────────────▲───────────────────┘
//!          │ gate                                │ message
//! ┌────────▼─────────┐                           │
//! │  EventConsumer   │───────────────────────────┘
//! │ (fetch + ledger) │
//! └──────────────────┘
//! ```

mod backpressure;
mod bulk;
mod consumer;
mod dispatcher;
mod heartbeat;
mod source;

pub use backpressure::{BackpressureFlag, InFlightCounter};
pub use bulk::{BulkCollector, BulkSummary};
pub use consumer::{
    AckPolicy, ConsumerConfig, ConsumerError, EventConsumer, LookupAction, Outcome, TaskProcessor,
};
pub use dispatcher::{BoundedDispatcher, DispatchSummary, DispatcherConfig, WorkItem};
pub use heartbeat::HeartbeatMonitor;
pub use source::{PagedAssetSource, SourceConfig, SourceSummary};
