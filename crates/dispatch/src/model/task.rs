//! Task: one unit of event-driven work against one asset
//!
//! The in-process state machine is `Pending → Active → {Succeeded | Failed}`.
//! The ledger record is the only externally visible projection of a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Asset;
use crate::telemetry::TraceContext;

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, not yet picked up by a handler
    Pending,

    /// A handler is executing the task
    Active,

    /// Collection finished without error
    Succeeded,

    /// Collection finished with an error
    Failed,
}

impl TaskState {
    /// Succeeded and Failed are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `next` is a valid successor of this state
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (Self::Active, Self::Succeeded)
                | (Self::Active, Self::Failed)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid task transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskState,
    pub to: TaskState,
}

/// How inventory is collected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionMethod {
    /// Locally on the host
    #[serde(rename = "inband", alias = "local")]
    Inband,

    /// Remotely through the management controller
    #[default]
    #[serde(rename = "outofband", alias = "remote")]
    Outofband,
}

impl std::fmt::Display for CollectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inband => write!(f, "inband"),
            Self::Outofband => write!(f, "outofband"),
        }
    }
}

/// Payload of a task-describing stream event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    /// Task identifier, shared by every redelivery of the event
    pub id: Uuid,

    /// Facility partitioning the ledger keys
    pub facility: String,

    /// Target asset
    pub asset_id: Uuid,

    #[serde(default)]
    pub method: CollectionMethod,

    #[serde(default)]
    pub collect_bios_configuration: bool,

    /// Free-form request parameters, kept for the record
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

impl TaskRequest {
    /// Create a request for out-of-band inventory collection
    pub fn new(facility: impl Into<String>, asset_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            facility: facility.into(),
            asset_id,
            method: CollectionMethod::default(),
            collect_bios_configuration: false,
            parameters: None,
        }
    }

    /// Request BIOS configuration collection as well
    pub fn with_bios_configuration(mut self) -> Self {
        self.collect_bios_configuration = true;
        self
    }

    /// Set the collection method
    pub fn with_method(mut self, method: CollectionMethod) -> Self {
        self.method = method;
        self
    }

    /// Decode a request from an event payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Encode the request as an event payload
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// One unit of work against one asset
///
/// Owned exclusively by the handler processing it.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    state: TaskState,
    status: String,
    pub facility: String,
    pub method: CollectionMethod,
    pub collect_bios_configuration: bool,

    /// Originating request, as received
    pub request: serde_json::Value,

    pub asset: Asset,

    /// Last revision written to the ledger for this task
    pub revision: Option<u64>,

    /// Whether a failure may succeed on redelivery
    pub retryable: bool,

    /// Trace context of the originating message, if it carried one
    pub trace_context: Option<TraceContext>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a pending task from an event request
    pub fn from_request(request: &TaskRequest) -> Self {
        let now = Utc::now();
        Self {
            id: request.id,
            state: TaskState::Pending,
            status: "pending".to_string(),
            facility: request.facility.clone(),
            method: request.method,
            collect_bios_configuration: request.collect_bios_configuration,
            request: serde_json::to_value(request).unwrap_or(serde_json::Value::Null),
            asset: Asset::new(request.asset_id, request.facility.clone()),
            revision: None,
            retryable: false,
            trace_context: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a pending task for an asset enumerated by the bulk path
    pub fn for_asset(asset: Asset, collect_bios_configuration: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            state: TaskState::Pending,
            status: "pending".to_string(),
            facility: asset.facility.clone(),
            method: CollectionMethod::Outofband,
            collect_bios_configuration,
            request: serde_json::Value::Null,
            asset,
            revision: None,
            retryable: false,
            trace_context: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Adopt an existing ledger revision (reclaiming an orphaned task)
    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Attach the trace context the task was requested under
    pub fn with_trace_context(mut self, trace_context: Option<TraceContext>) -> Self {
        self.trace_context = trace_context;
        self
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    /// Move to `next`, replacing the status message
    ///
    /// Leaves the task untouched when the transition is not allowed.
    pub fn transition(
        &mut self,
        next: TaskState,
        status: impl Into<String>,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.status = status.into();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Ledger key: `{facility}.{task-id}`
    pub fn ledger_key(&self) -> String {
        ledger_key(&self.facility, self.id)
    }
}

/// Ledger key for a task in a facility
pub fn ledger_key(facility: &str, task_id: Uuid) -> String {
    format!("{}.{}", facility, task_id)
}
