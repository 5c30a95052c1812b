//! Distributed task ledger
//!
//! Every worker publishes the lifecycle of the tasks it runs to a shared
//! bucket keyed `{facility}.{task-id}`. Lookups classify a task as not
//! started, in progress, complete, orphaned (safe to reclaim) or
//! indeterminate.

mod record;
mod task_ledger;

pub use record::{LedgerRecord, LedgerStatus};
pub use task_ledger::{LedgerConfig, LedgerError, TaskLedger};
