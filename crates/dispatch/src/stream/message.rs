//! EventStream and StreamMessage definitions

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::telemetry::TraceContext;

/// Error type for stream operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The stream or its consumer is not provisioned
    #[error("stream subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// The message was already acknowledged or redelivered elsewhere
    #[error("message {0} is no longer pending")]
    NotPending(u64),

    /// Transport failure talking to the stream
    #[error("stream transport error: {0}")]
    Transport(String),
}

impl StreamError {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SubscriptionNotFound(_) => "subscription_not_found",
            Self::NotPending(_) => "not_pending",
            Self::Transport(_) => "transport",
        }
    }
}

/// Acknowledgement applied to a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Processing finished; never redeliver
    Ack,
    /// Redeliver as soon as possible
    Nak,
    /// Still working; extend the redelivery deadline
    InProgress,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Nak => "nak",
            Self::InProgress => "in_progress",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend hook that applies dispositions for one delivery
#[async_trait]
pub trait MessageAcker: Send + Sync + 'static {
    async fn apply(&self, disposition: Disposition) -> Result<(), StreamError>;
}

/// One delivery of a stream message
#[derive(Clone)]
pub struct StreamMessage {
    payload: Vec<u8>,
    subject: String,
    trace_context: Option<TraceContext>,
    delivery_count: u64,
    acker: Arc<dyn MessageAcker>,
}

impl StreamMessage {
    pub fn new(
        payload: Vec<u8>,
        subject: impl Into<String>,
        delivery_count: u64,
        acker: Arc<dyn MessageAcker>,
    ) -> Self {
        Self {
            payload,
            subject: subject.into(),
            trace_context: None,
            delivery_count,
            acker,
        }
    }

    pub fn with_trace_context(mut self, trace_context: Option<TraceContext>) -> Self {
        self.trace_context = trace_context;
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn trace_context(&self) -> Option<&TraceContext> {
        self.trace_context.as_ref()
    }

    /// 1 on first delivery
    pub fn delivery_count(&self) -> u64 {
        self.delivery_count
    }

    /// Finish the message
    pub async fn ack(&self) -> Result<(), StreamError> {
        self.acker.apply(Disposition::Ack).await
    }

    /// Request redelivery
    pub async fn nak(&self) -> Result<(), StreamError> {
        self.acker.apply(Disposition::Nak).await
    }

    /// Extend the redelivery deadline
    pub async fn in_progress(&self) -> Result<(), StreamError> {
        self.acker.apply(Disposition::InProgress).await
    }

    pub async fn apply(&self, disposition: Disposition) -> Result<(), StreamError> {
        self.acker.apply(disposition).await
    }
}

impl std::fmt::Debug for StreamMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMessage")
            .field("subject", &self.subject)
            .field("delivery_count", &self.delivery_count)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Pull consumer of task events
#[async_trait]
pub trait EventStream: Send + Sync + 'static {
    /// Check that the stream and its consumer exist
    async fn verify(&self) -> Result<(), StreamError>;

    /// Pull up to `batch` messages, waiting at most `wait` for the first
    async fn fetch(&self, batch: usize, wait: Duration) -> Result<Vec<StreamMessage>, StreamError>;
}
