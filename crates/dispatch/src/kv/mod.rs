//! Revisioned key-value buckets
//!
//! This module provides:
//! - [`KeyValueStore`] trait with create-if-absent and compare-and-swap updates
//! - [`InMemoryKeyValueStore`] for testing and single-process runs
//! - [`PostgresKeyValueStore`] for buckets shared between worker processes

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryKeyValueStore;
pub use postgres::PostgresKeyValueStore;
pub use store::{KeyValueStore, KvEntry, KvError};
