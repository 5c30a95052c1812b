//! Paged enumeration of the inventory store
//!
//! Emits every asset of the store on a channel, page by page, holding off
//! while the dispatcher signals backpressure.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backpressure::BackpressureFlag;
use crate::config::duration_millis;
use crate::inventory::InventoryStore;
use crate::metrics;
use crate::model::Asset;

/// Source configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Assets per page; at least 1
    pub page_size: usize,

    /// How often a paused source re-checks the flag
    #[serde(with = "duration_millis")]
    pub pause_poll_interval: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            pause_poll_interval: Duration::from_secs(1),
        }
    }
}

impl SourceConfig {
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub fn with_pause_poll_interval(mut self, interval: Duration) -> Self {
        self.pause_poll_interval = interval;
        self
    }
}

/// What an enumeration did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSummary {
    /// Total reported by the first page, if it was fetched
    pub total: Option<usize>,
    pub pages_fetched: usize,
    pub page_errors: usize,
    pub emitted: usize,
    /// Enumeration stopped early on cancellation or a dropped receiver
    pub interrupted: bool,
}

enum Flow {
    Continue,
    Stop,
}

/// Pages through an [`InventoryStore`] and emits assets in page order
pub struct PagedAssetSource {
    store: Arc<dyn InventoryStore>,
    flag: BackpressureFlag,
    config: SourceConfig,
}

impl PagedAssetSource {
    pub fn new(store: Arc<dyn InventoryStore>, flag: BackpressureFlag, config: SourceConfig) -> Self {
        Self {
            store,
            flag,
            config,
        }
    }

    /// Start enumerating on a background task
    ///
    /// The receiver closes when enumeration ends.
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<Asset>, JoinHandle<SourceSummary>) {
        let (tx, rx) = mpsc::channel(self.config.page_size.max(1));
        let handle = tokio::spawn(async move { self.run(tx, cancel).await });
        (rx, handle)
    }

    /// Enumerate into `tx`, returning once every reachable page was emitted
    ///
    /// `tx` is dropped on return, which is the consumer's completion signal.
    #[instrument(skip_all, fields(page_size = self.config.page_size))]
    pub async fn run(&self, tx: mpsc::Sender<Asset>, cancel: CancellationToken) -> SourceSummary {
        let limit = self.config.page_size.max(1);
        let mut summary = SourceSummary::default();

        if !self.wait_while_paused(&cancel).await {
            summary.interrupted = true;
            return summary;
        }

        let total = match self.store.assets_by_offset_limit(1, limit).await {
            Ok((assets, total)) => {
                summary.pages_fetched += 1;
                summary.total = Some(total);
                if let Flow::Stop = self.emit(assets, &tx, &cancel, &mut summary).await {
                    return summary;
                }
                total
            }
            Err(e) => {
                warn!(error = %e, "first page fetch failed, total unknown");
                summary.page_errors += 1;
                metrics::page_error();
                return summary;
            }
        };

        if total > limit {
            let remaining = (total - limit).div_ceil(limit);
            debug!(total, remaining, "paging through inventory");

            for offset in 2..=remaining + 1 {
                if !self.wait_while_paused(&cancel).await {
                    summary.interrupted = true;
                    return summary;
                }

                match self.store.assets_by_offset_limit(offset, limit).await {
                    Ok((assets, _)) if assets.is_empty() => {
                        debug!(offset, "empty page, ending enumeration");
                        summary.pages_fetched += 1;
                        break;
                    }
                    Ok((assets, _)) => {
                        summary.pages_fetched += 1;
                        if let Flow::Stop = self.emit(assets, &tx, &cancel, &mut summary).await {
                            return summary;
                        }
                    }
                    Err(e) => {
                        warn!(offset, error = %e, "page fetch failed, skipping");
                        summary.page_errors += 1;
                        metrics::page_error();
                    }
                }
            }
        }

        info!(
            emitted = summary.emitted,
            page_errors = summary.page_errors,
            "inventory enumeration finished"
        );
        summary
    }

    // Returns false when cancelled.
    async fn wait_while_paused(&self, cancel: &CancellationToken) -> bool {
        let mut logged = false;
        while self.flag.value() {
            if cancel.is_cancelled() {
                return false;
            }
            if !logged {
                debug!("source paused by backpressure");
                logged = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.pause_poll_interval) => {}
            }
        }
        !cancel.is_cancelled()
    }

    async fn emit(
        &self,
        assets: Vec<Asset>,
        tx: &mpsc::Sender<Asset>,
        cancel: &CancellationToken,
        summary: &mut SourceSummary,
    ) -> Flow {
        for asset in assets {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.interrupted = true;
                    return Flow::Stop;
                }
                sent = tx.send(asset) => sent,
            };
            if sent.is_err() {
                debug!("receiver dropped, ending enumeration");
                summary.interrupted = true;
                return Flow::Stop;
            }
            summary.emitted += 1;
            metrics::assets_emitted(1);
        }
        Flow::Continue
    }
}
