//! Inventory store collaborator
//!
//! This module provides:
//! - [`InventoryStore`] trait the engine reads assets from and writes results to
//! - [`InMemoryInventoryStore`] for testing

mod memory;
mod store;

pub use memory::InMemoryInventoryStore;
pub use store::{InventoryStore, StoreError};
