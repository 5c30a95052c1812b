//! Scripted DeviceCollector for tests and dry runs

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use super::device::{CollectorError, DeviceCollector};
use crate::model::Asset;

#[derive(Default)]
struct Script {
    inventory_failures: HashMap<Uuid, CollectorError>,
    bios_failures: HashMap<Uuid, CollectorError>,
    hanging: HashSet<Uuid>,
    delay: Duration,
    calls: Vec<Uuid>,
    credentialed_calls: usize,
}

/// Device collector that fabricates inventory and fails on demand
///
/// Clones share the same script, so a test can keep a handle after passing
/// the collector to the engine.
#[derive(Clone, Default)]
pub struct ScriptedCollector {
    script: Arc<Mutex<Script>>,
    running: Arc<AtomicUsize>,
    peak_running: Arc<AtomicUsize>,
}

impl ScriptedCollector {
    /// Create a collector where every query succeeds immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every query take `delay`
    pub fn with_delay(self, delay: Duration) -> Self {
        self.script.lock().delay = delay;
        self
    }

    /// Fail inventory queries for an asset
    pub fn fail_inventory(&self, asset_id: Uuid, error: CollectorError) {
        self.script.lock().inventory_failures.insert(asset_id, error);
    }

    /// Fail BIOS configuration queries for an asset
    pub fn fail_bios_configuration(&self, asset_id: Uuid, error: CollectorError) {
        self.script.lock().bios_failures.insert(asset_id, error);
    }

    /// Make inventory queries for an asset never return
    pub fn hang(&self, asset_id: Uuid) {
        self.script.lock().hanging.insert(asset_id);
    }

    /// Number of inventory queries issued so far
    pub fn inventory_calls(&self) -> usize {
        self.script.lock().calls.len()
    }

    /// Inventory queries that arrived with controller credentials
    pub fn credentialed_calls(&self) -> usize {
        self.script.lock().credentialed_calls
    }

    /// Highest number of queries observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    async fn simulate(&self, asset_id: Uuid) {
        let (delay, hang) = {
            let script = self.script.lock();
            (script.delay, script.hanging.contains(&asset_id))
        };

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(running, Ordering::SeqCst);

        if hang {
            futures::future::pending::<()>().await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceCollector for ScriptedCollector {
    async fn inventory(&self, asset: &mut Asset) -> Result<(), CollectorError> {
        {
            let mut script = self.script.lock();
            script.calls.push(asset.id);
            if asset.credentials.is_some() {
                script.credentialed_calls += 1;
            }
        }
        self.simulate(asset.id).await;

        if let Some(error) = self.script.lock().inventory_failures.get(&asset.id) {
            return Err(error.clone());
        }

        asset.vendor.get_or_insert_with(|| "supermicro".to_string());
        asset.model.get_or_insert_with(|| "x11dph-t".to_string());
        let serial = format!("SN-{}", asset.id.simple());
        asset.serial.get_or_insert(serial);
        asset.inventory = Some(json!({
            "bmc_address": asset.bmc_address,
            "components": [
                {"slug": "bios", "firmware": "2.4"},
                {"slug": "bmc", "firmware": "1.71"},
            ],
        }));
        Ok(())
    }

    async fn bios_configuration(&self, asset: &mut Asset) -> Result<(), CollectorError> {
        self.simulate(asset.id).await;

        if let Some(error) = self.script.lock().bios_failures.get(&asset.id) {
            return Err(error.clone());
        }

        asset.bios_configuration = Some(json!({
            "boot_mode": "UEFI",
            "sriov": "enabled",
        }));
        Ok(())
    }
}
