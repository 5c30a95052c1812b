//! Ledger records and lookup results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Task, TaskState};
use crate::telemetry::TraceContext;

/// Projection of a task stored in the ledger bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Worker that last wrote the record
    pub worker_id: String,

    /// Asset the task collects from
    pub target: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    pub state: TaskState,
    pub status: String,

    /// Set on failures the owner released for redelivery
    #[serde(default)]
    pub retryable: bool,

    pub updated_at: DateTime<Utc>,
}

impl LedgerRecord {
    /// Snapshot a task as written by `worker_id`
    pub fn from_task(task: &Task, worker_id: &str, trace: Option<TraceContext>) -> Self {
        let (trace_id, span_id) = trace
            .map(|tc| (Some(tc.trace_id), Some(tc.span_id)))
            .unwrap_or((None, None));

        Self {
            worker_id: worker_id.to_string(),
            target: task.asset.id,
            trace_id,
            span_id,
            state: task.state(),
            status: task.status().to_string(),
            retryable: task.retryable,
            updated_at: Utc::now(),
        }
    }

    /// Whether the task reached an outcome that redelivery must not repeat
    pub fn is_complete(&self) -> bool {
        match self.state {
            TaskState::Succeeded => true,
            TaskState::Failed => !self.retryable,
            TaskState::Pending | TaskState::Active => false,
        }
    }
}

/// Result of looking a task up in the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerStatus {
    /// No record exists
    NotStarted,

    /// A live worker owns the task
    InProgress { record: LedgerRecord },

    /// The task finished; redeliveries are acknowledged without work
    Complete { record: LedgerRecord },

    /// The record exists but its owner stopped heartbeating or released it
    Orphaned { revision: u64, record: LedgerRecord },

    /// The lookup failed or the record could not be read
    Indeterminate { reason: String },
}

impl LedgerStatus {
    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress { .. } => "in_progress",
            Self::Complete { .. } => "complete",
            Self::Orphaned { .. } => "orphaned",
            Self::Indeterminate { .. } => "indeterminate",
        }
    }

    /// Whether this worker may execute the task
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::NotStarted | Self::Orphaned { .. })
    }
}

impl std::fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
