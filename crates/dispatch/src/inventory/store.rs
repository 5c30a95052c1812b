//! InventoryStore trait definition

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::Asset;

/// Error type for inventory store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Asset not found
    #[error("asset not found: {0}")]
    AssetNotFound(Uuid),

    /// Store rejected our credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Request to the store timed out
    #[error("store request timed out: {0}")]
    Timeout(String),

    /// Any other backend or transport failure
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Backend(_))
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AssetNotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Timeout(_) => "timeout",
            Self::Backend(_) => "backend",
        }
    }
}

/// Source of truth for assets and destination for collected inventory
///
/// Implementations must be safe for concurrent use by many handlers.
#[async_trait]
pub trait InventoryStore: Send + Sync + 'static {
    /// Fetch one asset, optionally with its management controller credentials
    async fn asset_by_id(&self, id: Uuid, include_credentials: bool)
        -> Result<Asset, StoreError>;

    /// Fetch one page of assets
    ///
    /// `offset` is the 1-based page number, `limit` the page size. Returns the
    /// page's assets and the total number of assets in the store.
    async fn assets_by_offset_limit(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Asset>, usize), StoreError>;

    /// Persist collected inventory and configuration for an asset
    async fn asset_update(&self, asset: &Asset) -> Result<(), StoreError>;
}
