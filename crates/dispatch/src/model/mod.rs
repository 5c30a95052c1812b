//! Domain model: assets, tasks and the task state machine

mod asset;
mod task;

pub use asset::{Asset, BmcCredentials};
pub use task::{
    ledger_key, CollectionMethod, Task, TaskRequest, TaskState, TransitionError,
};
