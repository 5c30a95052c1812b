//! TaskLedger over a revisioned key-value bucket

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::record::{LedgerRecord, LedgerStatus};
use crate::config::duration_millis;
use crate::kv::{InMemoryKeyValueStore, KeyValueStore, KvError, PostgresKeyValueStore};
use crate::metrics;
use crate::model::{ledger_key, Task};
use crate::telemetry;

/// Ledger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Key-value bucket holding the records
    pub bucket: String,

    /// Age after which an unfinished record is considered orphaned
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,

    /// Max age of records in the bucket
    #[serde(with = "duration_millis")]
    pub retention: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            bucket: "inventory-tasks".to_string(),
            stale_threshold: Duration::from_secs(10 * 60),
            retention: Duration::from_secs(10 * 24 * 60 * 60),
        }
    }
}

impl LedgerConfig {
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Error type for ledger writes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Another worker wrote the record first
    #[error("ledger conflict on {key}: {source}")]
    Conflict {
        key: String,
        #[source]
        source: KvError,
    },

    /// The bucket rejected the write
    #[error(transparent)]
    Kv(KvError),

    /// The record could not be encoded
    #[error("ledger serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "conflict",
            Self::Kv(_) => "kv",
            Self::Serialization(_) => "serialization",
        }
    }
}

/// Shared record of task ownership and outcome
///
/// # Example
///
/// ```
/// use inventory_dispatch::ledger::{LedgerConfig, TaskLedger};
///
/// let ledger = TaskLedger::in_memory("worker-1", LedgerConfig::default());
/// assert_eq!(ledger.worker_id(), "worker-1");
/// ```
#[derive(Clone)]
pub struct TaskLedger {
    kv: Arc<dyn KeyValueStore>,
    worker_id: String,
    config: LedgerConfig,
}

impl TaskLedger {
    /// Create a ledger over an existing bucket
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        worker_id: impl Into<String>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            kv,
            worker_id: worker_id.into(),
            config,
        }
    }

    /// Create a ledger over a private in-memory bucket honoring the retention
    pub fn in_memory(worker_id: impl Into<String>, config: LedgerConfig) -> Self {
        let kv = InMemoryKeyValueStore::new(config.bucket.clone()).with_max_age(config.retention);
        Self::new(Arc::new(kv), worker_id, config)
    }

    /// Create a ledger over the configured PostgreSQL bucket
    ///
    /// The schema must already be migrated.
    pub async fn postgres(
        pool: PgPool,
        worker_id: impl Into<String>,
        config: LedgerConfig,
    ) -> Result<Self, KvError> {
        let kv =
            PostgresKeyValueStore::bind(pool, config.bucket.clone(), Some(config.retention)).await?;
        Ok(Self::new(Arc::new(kv), worker_id, config))
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Get the underlying bucket
    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    /// Classify a task by its ledger record
    ///
    /// Never fails: read errors and undecodable records are reported as
    /// [`LedgerStatus::Indeterminate`].
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn lookup(&self, task_id: Uuid, facility: &str) -> LedgerStatus {
        let key = ledger_key(facility, task_id);

        let entry = match self.kv.get(&key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return LedgerStatus::NotStarted,
            Err(e) => {
                warn!(%key, error = %e, "ledger lookup failed");
                return LedgerStatus::Indeterminate {
                    reason: e.to_string(),
                };
            }
        };

        let record: LedgerRecord = match serde_json::from_slice(&entry.value) {
            Ok(record) => record,
            Err(e) => {
                warn!(%key, error = %e, "undecodable ledger record");
                return LedgerStatus::Indeterminate {
                    reason: format!("undecodable record: {}", e),
                };
            }
        };

        if record.is_complete() {
            return LedgerStatus::Complete { record };
        }
        if record.retryable {
            return LedgerStatus::Orphaned {
                revision: entry.revision,
                record,
            };
        }

        // Age comes from the bucket's write time, not the writer's clock.
        let age = (Utc::now() - entry.updated_at).to_std().unwrap_or_default();
        if age > self.config.stale_threshold {
            debug!(%key, owner = %record.worker_id, ?age, "ledger record is stale");
            LedgerStatus::Orphaned {
                revision: entry.revision,
                record,
            }
        } else {
            LedgerStatus::InProgress { record }
        }
    }

    /// Write the task's current state
    ///
    /// Creates the record on first publish, then updates it against the
    /// task's last revision. The new revision is stored on the task. Every
    /// failure is counted; callers log it and carry on.
    #[instrument(skip(self, task), fields(worker_id = %self.worker_id, task_id = %task.id, state = %task.state()))]
    pub async fn publish(&self, task: &mut Task) -> Result<u64, LedgerError> {
        let result = self.write(task).await;
        if let Err(e) = &result {
            metrics::ledger_publish_failed(e.kind());
        }
        result
    }

    async fn write(&self, task: &mut Task) -> Result<u64, LedgerError> {
        let key = task.ledger_key();
        let trace = telemetry::current_trace_context().or_else(|| task.trace_context.clone());
        let record = LedgerRecord::from_task(task, &self.worker_id, trace);
        let value =
            serde_json::to_vec(&record).map_err(|e| LedgerError::Serialization(e.to_string()))?;

        let written = match task.revision {
            None => self.kv.create(&key, value).await,
            Some(revision) => self.kv.update(&key, value, revision).await,
        };

        let revision = written.map_err(|e| {
            if e.is_conflict() {
                LedgerError::Conflict {
                    key: key.clone(),
                    source: e,
                }
            } else {
                LedgerError::Kv(e)
            }
        })?;

        debug!(%key, revision, "published ledger record");
        task.revision = Some(revision);
        Ok(revision)
    }

    /// Decoded records of one facility, sorted by key
    ///
    /// Undecodable records are skipped.
    pub async fn records(&self, facility: &str) -> Result<Vec<LedgerRecord>, KvError> {
        let prefix = format!("{}.", facility);
        let mut records = Vec::new();

        for key in self.kv.keys(&prefix).await? {
            let Some(entry) = self.kv.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice(&entry.value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(%key, error = %e, "skipping undecodable ledger record"),
            }
        }

        Ok(records)
    }
}
