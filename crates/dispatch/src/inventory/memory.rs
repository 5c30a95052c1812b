//! In-memory implementation of InventoryStore for testing

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::model::Asset;

/// Injected lookup failure
struct LookupFailure {
    error: StoreError,
    remaining: usize,
}

/// In-memory implementation of InventoryStore
///
/// Assets are paged in insertion order. Failures can be injected per page and
/// per asset to exercise the error paths of the source and the consumer.
///
/// # Example
///
/// ```
/// use inventory_dispatch::inventory::InMemoryInventoryStore;
/// use inventory_dispatch::model::Asset;
/// use uuid::Uuid;
///
/// let store = InMemoryInventoryStore::new();
/// store.insert(Asset::new(Uuid::now_v7(), "sandbox"));
/// assert_eq!(store.asset_count(), 1);
/// ```
pub struct InMemoryInventoryStore {
    assets: RwLock<Vec<Asset>>,
    updated: RwLock<HashMap<Uuid, Asset>>,
    failing_pages: RwLock<HashSet<usize>>,
    lookup_failures: RwLock<HashMap<Uuid, LookupFailure>>,
    page_fetches: AtomicUsize,
}

impl InMemoryInventoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            assets: RwLock::new(Vec::new()),
            updated: RwLock::new(HashMap::new()),
            failing_pages: RwLock::new(HashSet::new()),
            lookup_failures: RwLock::new(HashMap::new()),
            page_fetches: AtomicUsize::new(0),
        }
    }

    /// Create a store holding `count` generated assets in `facility`
    pub fn with_generated_assets(count: usize, facility: &str) -> Self {
        let store = Self::new();
        for i in 0..count {
            store.insert(
                Asset::new(Uuid::now_v7(), facility)
                    .with_bmc_address(format!("10.0.{}.{}", i / 250, i % 250 + 1))
                    .with_credentials("root", "calvin"),
            );
        }
        store
    }

    /// Add an asset
    pub fn insert(&self, asset: Asset) {
        self.assets.write().push(asset);
    }

    /// Get the number of assets
    pub fn asset_count(&self) -> usize {
        self.assets.read().len()
    }

    /// All asset ids in page order
    pub fn asset_ids(&self) -> Vec<Uuid> {
        self.assets.read().iter().map(|a| a.id).collect()
    }

    /// Make every fetch of page `offset` fail
    pub fn fail_page(&self, offset: usize) {
        self.failing_pages.write().insert(offset);
    }

    /// Make the next `times` lookups of `id` fail with `error`
    pub fn fail_lookup(&self, id: Uuid, error: StoreError, times: usize) {
        self.lookup_failures.write().insert(
            id,
            LookupFailure {
                error,
                remaining: times,
            },
        );
    }

    /// Number of page fetches served, failures included
    pub fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::Relaxed)
    }

    /// The last persisted version of an asset
    pub fn updated_asset(&self, id: Uuid) -> Option<Asset> {
        self.updated.read().get(&id).cloned()
    }

    /// Number of assets persisted through `asset_update`
    pub fn updated_count(&self) -> usize {
        self.updated.read().len()
    }
}

impl Default for InMemoryInventoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn asset_by_id(
        &self,
        id: Uuid,
        include_credentials: bool,
    ) -> Result<Asset, StoreError> {
        {
            let mut failures = self.lookup_failures.write();
            if let Some(failure) = failures.get_mut(&id) {
                if failure.remaining > 0 {
                    failure.remaining -= 1;
                    return Err(failure.error.clone());
                }
                failures.remove(&id);
            }
        }

        let assets = self.assets.read();
        let mut asset = assets
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(StoreError::AssetNotFound(id))?;

        if !include_credentials {
            asset.credentials = None;
        }
        Ok(asset)
    }

    async fn assets_by_offset_limit(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Asset>, usize), StoreError> {
        self.page_fetches.fetch_add(1, Ordering::Relaxed);

        if self.failing_pages.read().contains(&offset) {
            return Err(StoreError::Backend(format!("page {} unavailable", offset)));
        }

        let assets = self.assets.read();
        let total = assets.len();
        let start = offset.saturating_sub(1).saturating_mul(limit);
        let page = assets.iter().skip(start).take(limit).cloned().collect();
        Ok((page, total))
    }

    async fn asset_update(&self, asset: &Asset) -> Result<(), StoreError> {
        if !self.assets.read().iter().any(|a| a.id == asset.id) {
            return Err(StoreError::AssetNotFound(asset.id));
        }
        self.updated.write().insert(asset.id, asset.clone());
        Ok(())
    }
}
