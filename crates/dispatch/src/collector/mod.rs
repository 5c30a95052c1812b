//! Device collector collaborator
//!
//! This module provides:
//! - [`DeviceCollector`] trait for querying a device or its management controller
//! - [`AssetCollector`] composing device queries with the inventory store update
//! - [`ScriptedCollector`] for tests
//! - The collection error taxonomy ([`CollectorError`], [`CollectError`])

mod asset;
mod device;
mod scripted;

pub use asset::AssetCollector;
pub use device::{CollectError, CollectorError, DeviceCollector};
pub use scripted::ScriptedCollector;
