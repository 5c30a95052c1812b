//! KeyValueStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Error type for bucket operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    /// `create` found a live entry under the key
    #[error("key already exists: {0}")]
    KeyExists(String),

    /// `update` was issued against a revision that is no longer current
    #[error("revision mismatch for {key}: expected {expected}, current {actual}")]
    RevisionMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// `update` targeted a key with no live entry
    #[error("key not found: {0}")]
    NotFound(String),

    /// The bucket does not exist in the backend
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    /// Transport or database failure
    #[error("kv backend error: {0}")]
    Backend(String),
}

impl KvError {
    /// Whether the error comes from a competing writer rather than the backend
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::KeyExists(_) | Self::RevisionMismatch { .. } | Self::NotFound(_)
        )
    }
}

/// A live entry read from a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Assigned by the store; strictly increases on every write to the key
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

/// A bucket of opaque values with store-assigned revisions
///
/// Entries older than the bucket's max age read as absent and may be
/// recreated with `create`.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Name of the bucket
    fn bucket(&self) -> &str;

    /// Write `value` only if the key has no live entry
    ///
    /// Returns the new revision, or [`KvError::KeyExists`].
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError>;

    /// Replace the value only if the current revision equals `expected`
    ///
    /// Returns the new revision, or [`KvError::RevisionMismatch`] /
    /// [`KvError::NotFound`] without modifying the entry.
    async fn update(&self, key: &str, value: Vec<u8>, expected: u64) -> Result<u64, KvError>;

    /// Read the live entry for a key
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError>;

    /// List live keys starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}
