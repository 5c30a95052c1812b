//! DeviceCollector trait definition

use async_trait::async_trait;

use crate::inventory::StoreError;
use crate::model::Asset;

/// Error type for device queries
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectorError {
    /// The management controller rejected the credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The device did not answer in time
    #[error("device query timed out: {0}")]
    Timeout(String),

    /// The device could not be reached
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// The collector failed internally
    #[error("collector error: {0}")]
    Internal(String),

    /// No collector is configured for the requested method
    #[error("unsupported collection method: {0}")]
    Unsupported(String),
}

impl CollectorError {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Timeout(_) => "timeout",
            Self::Unreachable(_) => "unreachable",
            Self::Internal(_) => "internal",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

/// Failure of a complete collection run against one asset
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectError {
    /// Reading from or writing to the inventory store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Querying the device failed
    #[error(transparent)]
    Collector(#[from] CollectorError),

    /// The task-level deadline passed before collection finished
    #[error("collection exceeded its deadline of {0:?}")]
    DeadlineExceeded(std::time::Duration),
}

impl CollectError {
    /// Whether redelivering the task may produce a different outcome
    ///
    /// Only transient store failures qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Collector(_) | Self::DeadlineExceeded(_) => false,
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(e) => e.kind(),
            Self::Collector(e) => e.kind(),
            Self::DeadlineExceeded(_) => "deadline_exceeded",
        }
    }
}

/// Queries a device (locally or through its management controller)
///
/// Both operations mutate the asset in place and append partial failures to
/// `asset.errors`. Implementations must be safe for concurrent use.
#[async_trait]
pub trait DeviceCollector: Send + Sync + 'static {
    /// Collect hardware inventory
    async fn inventory(&self, asset: &mut Asset) -> Result<(), CollectorError>;

    /// Collect BIOS configuration
    async fn bios_configuration(&self, asset: &mut Asset) -> Result<(), CollectorError>;
}
