//! Collection runs against one asset
//!
//! Composes a [`DeviceCollector`] with the [`InventoryStore`]: query the
//! device, then persist what was collected.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument, warn};

use super::device::{CollectError, CollectorError, DeviceCollector};
use crate::inventory::InventoryStore;
use crate::metrics;
use crate::model::{Asset, CollectionMethod};

const QUERY_INVENTORY: &str = "inventory";
const QUERY_BIOS_CONFIGURATION: &str = "bios_configuration";

/// Runs device queries for an asset and writes the results back
///
/// `device` reaches assets through their management controller. An inband
/// collector, when attached, serves tasks that ask for local collection.
#[derive(Clone)]
pub struct AssetCollector {
    device: Arc<dyn DeviceCollector>,
    inband: Option<Arc<dyn DeviceCollector>>,
    store: Arc<dyn InventoryStore>,
}

impl AssetCollector {
    /// Create a collector over an out-of-band device collector and an inventory store
    pub fn new(device: Arc<dyn DeviceCollector>, store: Arc<dyn InventoryStore>) -> Self {
        Self {
            device,
            inband: None,
            store,
        }
    }

    /// Serve inband tasks with `device`
    pub fn with_inband(mut self, device: Arc<dyn DeviceCollector>) -> Self {
        self.inband = Some(device);
        self
    }

    /// Get the inventory store
    pub fn store(&self) -> &Arc<dyn InventoryStore> {
        &self.store
    }

    /// Bulk collection: every requested query runs, then the asset is stored
    ///
    /// Query failures are recorded on the asset and do not stop the run; the
    /// first one is returned after the store update succeeds.
    #[instrument(skip(self, asset), fields(asset_id = %asset.id))]
    pub async fn collect_bulk(
        &self,
        asset: &mut Asset,
        bios_configuration: bool,
    ) -> Result<(), CollectError> {
        let mut first_error = None;

        if let Err(e) = self.query(&self.device, QUERY_INVENTORY, asset).await {
            first_error.get_or_insert(e);
        }

        if bios_configuration {
            if let Err(e) = self
                .query(&self.device, QUERY_BIOS_CONFIGURATION, asset)
                .await
            {
                first_error.get_or_insert(e);
            }
        }

        self.store.asset_update(asset).await?;
        debug!(errors = asset.errors.len(), "asset updated");

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Single-task collection with the collector for `method`
    ///
    /// An inventory failure is recorded and the run continues; a BIOS
    /// configuration failure ends the run without updating the store. An
    /// inband task without an inband collector fails before any query.
    #[instrument(skip(self, asset), fields(asset_id = %asset.id, %method))]
    pub async fn collect_task(
        &self,
        asset: &mut Asset,
        method: CollectionMethod,
        bios_configuration: bool,
    ) -> Result<(), CollectError> {
        let device = self.device_for(method)?;
        let inventory_result = self.query(device, QUERY_INVENTORY, asset).await;

        if bios_configuration {
            self.query(device, QUERY_BIOS_CONFIGURATION, asset).await?;
        }

        self.store.asset_update(asset).await?;
        debug!(errors = asset.errors.len(), "asset updated");

        inventory_result.map_err(CollectError::from)
    }

    fn device_for(
        &self,
        method: CollectionMethod,
    ) -> Result<&Arc<dyn DeviceCollector>, CollectorError> {
        match method {
            CollectionMethod::Outofband => Ok(&self.device),
            CollectionMethod::Inband => self
                .inband
                .as_ref()
                .ok_or_else(|| CollectorError::Unsupported("no inband collector".into())),
        }
    }

    async fn query(
        &self,
        device: &Arc<dyn DeviceCollector>,
        query: &'static str,
        asset: &mut Asset,
    ) -> Result<(), CollectorError> {
        let started = Instant::now();
        let result = match query {
            QUERY_BIOS_CONFIGURATION => device.bios_configuration(asset).await,
            _ => device.inventory(asset).await,
        };

        // Labels are read after the query so a first inventory run is
        // attributed to the vendor it discovered.
        let vendor = asset.vendor_label().to_string();
        let model = asset.model_label().to_string();
        metrics::query_observed(query, &vendor, &model, started.elapsed());

        if let Err(e) = &result {
            warn!(
                asset_id = %asset.id,
                %vendor,
                %model,
                query,
                error = %e,
                "device query failed"
            );
            metrics::query_failed(query, &vendor, &model, e.kind());
            asset.push_error(format!("{}: {}", query, e));
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ScriptedCollector;
    use crate::inventory::{InMemoryInventoryStore, InventoryStore};

    async fn setup(
        device: ScriptedCollector,
    ) -> (AssetCollector, Arc<InMemoryInventoryStore>, Asset) {
        let store = Arc::new(InMemoryInventoryStore::with_generated_assets(1, "sandbox"));
        let asset = store
            .asset_by_id(store.asset_ids()[0], true)
            .await
            .unwrap();
        let collector = AssetCollector::new(Arc::new(device), store.clone());
        (collector, store, asset)
    }

    #[tokio::test]
    async fn test_bulk_collects_and_stores() {
        let (collector, store, mut asset) = setup(ScriptedCollector::new()).await;

        collector.collect_bulk(&mut asset, true).await.unwrap();

        let stored = store.updated_asset(asset.id).unwrap();
        assert!(stored.inventory.is_some());
        assert!(stored.bios_configuration.is_some());
        assert!(stored.errors.is_empty());
    }

    #[tokio::test]
    async fn test_bulk_runs_bios_after_inventory_failure() {
        let device = ScriptedCollector::new();
        let (collector, store, mut asset) = setup(device.clone()).await;
        device.fail_inventory(asset.id, CollectorError::Timeout("bmc".into()));

        let err = collector.collect_bulk(&mut asset, true).await.unwrap_err();
        assert_eq!(err, CollectError::Collector(CollectorError::Timeout("bmc".into())));

        let stored = store.updated_asset(asset.id).unwrap();
        assert!(stored.inventory.is_none());
        assert!(stored.bios_configuration.is_some());
        assert_eq!(stored.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_task_short_circuits_on_bios_failure() {
        let device = ScriptedCollector::new();
        let (collector, store, mut asset) = setup(device.clone()).await;
        device.fail_bios_configuration(asset.id, CollectorError::Internal("redfish".into()));

        let err = collector
            .collect_task(&mut asset, CollectionMethod::Outofband, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Collector(CollectorError::Internal(_))));
        assert!(!err.is_retryable());
        assert!(asset.inventory.is_some());
        assert!(store.updated_asset(asset.id).is_none());
    }

    #[tokio::test]
    async fn test_task_stores_partial_inventory() {
        let device = ScriptedCollector::new();
        let (collector, store, mut asset) = setup(device.clone()).await;
        device.fail_inventory(asset.id, CollectorError::Unauthorized("401".into()));

        let err = collector
            .collect_task(&mut asset, CollectionMethod::Outofband, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Collector(CollectorError::Unauthorized(_))));
        assert!(store.updated_asset(asset.id).is_some());
    }

    #[tokio::test]
    async fn test_task_routes_by_method() {
        let outofband = ScriptedCollector::new();
        let inband = ScriptedCollector::new();
        let (collector, store, mut asset) = setup(outofband.clone()).await;
        let collector = collector.with_inband(Arc::new(inband.clone()));

        collector
            .collect_task(&mut asset, CollectionMethod::Inband, false)
            .await
            .unwrap();
        assert_eq!(inband.inventory_calls(), 1);
        assert_eq!(outofband.inventory_calls(), 0);

        collector
            .collect_task(&mut asset, CollectionMethod::Outofband, false)
            .await
            .unwrap();
        assert_eq!(inband.inventory_calls(), 1);
        assert_eq!(outofband.inventory_calls(), 1);
        assert!(store.updated_asset(asset.id).is_some());
    }

    #[tokio::test]
    async fn test_inband_without_collector_is_unsupported() {
        let device = ScriptedCollector::new();
        let (collector, store, mut asset) = setup(device.clone()).await;

        let err = collector
            .collect_task(&mut asset, CollectionMethod::Inband, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Collector(CollectorError::Unsupported(_))));
        assert!(!err.is_retryable());
        assert_eq!(device.inventory_calls(), 0);
        assert!(store.updated_asset(asset.id).is_none());
    }

    #[tokio::test]
    async fn test_update_of_unknown_asset_is_permanent() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let collector = AssetCollector::new(Arc::new(ScriptedCollector::new()), store);
        let mut asset = Asset::new(uuid::Uuid::now_v7(), "sandbox");

        // Unknown to the store: update reports not found, which is permanent.
        let err = collector
            .collect_task(&mut asset, CollectionMethod::Outofband, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Store(_)));
        assert!(!err.is_retryable());
    }
}
