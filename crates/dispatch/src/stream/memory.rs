//! In-memory implementation of EventStream for testing

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::message::{Disposition, EventStream, MessageAcker, StreamError, StreamMessage};
use crate::telemetry::TraceContext;

struct Entry {
    payload: Vec<u8>,
    subject: String,
    trace_context: Option<TraceContext>,
    deliveries: u64,
    // Redelivery deadline of the outstanding delivery
    deadline: Option<Instant>,
    done: bool,
}

#[derive(Default)]
struct State {
    next_sequence: u64,
    entries: BTreeMap<u64, Entry>,
    ready: VecDeque<u64>,
    log: Vec<(u64, Disposition)>,
    verify_error: Option<StreamError>,
    fetch_failures: usize,
}

impl State {
    // Requeue deliveries whose ack wait elapsed.
    fn reclaim_expired(&mut self, now: Instant) {
        for (sequence, entry) in self.entries.iter_mut() {
            if entry.done {
                continue;
            }
            if let Some(deadline) = entry.deadline {
                if deadline <= now {
                    entry.deadline = None;
                    self.ready.push_back(*sequence);
                }
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    ack_wait: Duration,
}

/// In-memory work-queue stream with a single pull consumer
///
/// Delivered messages are redelivered when neither acked nor refreshed within
/// the ack wait. Every disposition is logged for inspection.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use inventory_dispatch::stream::InMemoryEventStream;
///
/// let stream = InMemoryEventStream::new(Duration::from_secs(300));
/// let sequence = stream.publish("sandbox.inventory", b"{}".to_vec());
/// assert_eq!(stream.pending_count(), 1);
/// assert_eq!(sequence, 1);
/// ```
#[derive(Clone)]
pub struct InMemoryEventStream {
    shared: Arc<Shared>,
}

impl InMemoryEventStream {
    /// Create a stream redelivering after `ack_wait`
    pub fn new(ack_wait: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                ack_wait,
            }),
        }
    }

    /// Append a message; returns its sequence number
    pub fn publish(&self, subject: impl Into<String>, payload: Vec<u8>) -> u64 {
        self.publish_with_trace(subject, payload, None)
    }

    /// Append a message carrying a trace context
    pub fn publish_with_trace(
        &self,
        subject: impl Into<String>,
        payload: Vec<u8>,
        trace_context: Option<TraceContext>,
    ) -> u64 {
        let sequence = {
            let mut state = self.shared.state.lock();
            state.next_sequence += 1;
            let sequence = state.next_sequence;
            state.entries.insert(
                sequence,
                Entry {
                    payload,
                    subject: subject.into(),
                    trace_context,
                    deliveries: 0,
                    deadline: None,
                    done: false,
                },
            );
            state.ready.push_back(sequence);
            sequence
        };
        self.shared.notify.notify_one();
        sequence
    }

    /// Make `verify` fail
    pub fn fail_verify(&self, error: StreamError) {
        self.shared.state.lock().verify_error = Some(error);
    }

    /// Make the next `times` fetches fail
    pub fn fail_fetches(&self, times: usize) {
        self.shared.state.lock().fetch_failures = times;
    }

    /// Messages not yet acked
    pub fn pending_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .entries
            .values()
            .filter(|e| !e.done)
            .count()
    }

    /// Deliveries made for a message so far
    pub fn deliveries(&self, sequence: u64) -> u64 {
        self.shared
            .state
            .lock()
            .entries
            .get(&sequence)
            .map(|e| e.deliveries)
            .unwrap_or(0)
    }

    /// Dispositions applied to a message, in order
    pub fn dispositions(&self, sequence: u64) -> Vec<Disposition> {
        self.shared
            .state
            .lock()
            .log
            .iter()
            .filter(|(s, _)| *s == sequence)
            .map(|(_, d)| *d)
            .collect()
    }

    /// Every disposition applied, in order
    pub fn disposition_log(&self) -> Vec<(u64, Disposition)> {
        self.shared.state.lock().log.clone()
    }

    fn take_ready(&self, batch: usize) -> Result<Vec<StreamMessage>, StreamError> {
        let now = Instant::now();
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(StreamError::Transport("fetch failed".to_string()));
        }

        state.reclaim_expired(now);

        let mut messages = Vec::new();
        while messages.len() < batch {
            let Some(sequence) = state.ready.pop_front() else {
                break;
            };
            let Some(entry) = state.entries.get_mut(&sequence) else {
                continue;
            };
            if entry.done || entry.deadline.is_some() {
                continue;
            }

            entry.deliveries += 1;
            entry.deadline = Some(now + self.shared.ack_wait);

            let acker = Arc::new(InMemoryAcker {
                shared: self.shared.clone(),
                sequence,
                delivery: entry.deliveries,
            });
            messages.push(
                StreamMessage::new(
                    entry.payload.clone(),
                    entry.subject.clone(),
                    entry.deliveries,
                    acker,
                )
                .with_trace_context(entry.trace_context.clone()),
            );
        }

        Ok(messages)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.shared
            .state
            .lock()
            .entries
            .values()
            .filter(|e| !e.done)
            .filter_map(|e| e.deadline)
            .min()
    }
}

#[async_trait]
impl EventStream for InMemoryEventStream {
    async fn verify(&self) -> Result<(), StreamError> {
        match self.shared.state.lock().verify_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn fetch(&self, batch: usize, wait: Duration) -> Result<Vec<StreamMessage>, StreamError> {
        let give_up = Instant::now() + wait;

        loop {
            let messages = self.take_ready(batch)?;
            if !messages.is_empty() || Instant::now() >= give_up {
                return Ok(messages);
            }

            // Wake on publish/nak, on the next redelivery deadline, or when
            // the fetch wait runs out.
            let wake_at = self
                .next_deadline()
                .map_or(give_up, |deadline| deadline.min(give_up));
            let _ = tokio::time::timeout_at(wake_at, self.shared.notify.notified()).await;
        }
    }
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    sequence: u64,
    delivery: u64,
}

#[async_trait]
impl MessageAcker for InMemoryAcker {
    async fn apply(&self, disposition: Disposition) -> Result<(), StreamError> {
        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let entry = state
                .entries
                .get_mut(&self.sequence)
                .filter(|e| !e.done && e.deliveries == self.delivery)
                .ok_or(StreamError::NotPending(self.sequence))?;

            match disposition {
                Disposition::Ack => {
                    entry.done = true;
                    entry.deadline = None;
                }
                Disposition::Nak => {
                    entry.deadline = None;
                    state.ready.push_back(self.sequence);
                }
                Disposition::InProgress => {
                    entry.deadline = Some(Instant::now() + self.shared.ack_wait);
                }
            }
            state.log.push((self.sequence, disposition));
        }

        if disposition == Disposition::Nak {
            self.shared.notify.notify_one();
        }
        Ok(())
    }
}
