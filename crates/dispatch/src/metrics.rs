//! Metric definitions for inventory dispatch monitoring
//!
//! Metrics are emitted through the `metrics` facade; the embedding process
//! decides whether and where to export them by installing a recorder.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Label for the dispatch path ("bulk" or "events").
pub const PATH_LABEL: &str = "path";

/// Label for hardware vendor.
pub const VENDOR_LABEL: &str = "vendor";

/// Label for hardware model.
pub const MODEL_LABEL: &str = "model";

/// Label for the device query kind ("inventory" or "bios_configuration").
pub const QUERY_LABEL: &str = "query";

/// Label for error kind.
pub const ERROR_KIND_LABEL: &str = "error_kind";

/// Label for a stream message disposition ("ack", "nak", "in_progress").
pub const DISPOSITION_LABEL: &str = "disposition";

/// Label for why a stream message was dropped unprocessed ("malformed", "foreign_facility").
pub const REASON_LABEL: &str = "reason";

/// Label for the stream operation that failed.
pub const OPERATION_LABEL: &str = "operation";

// Dispatcher metrics

/// Counter for units of work handed to a handler.
pub const TASKS_DISPATCHED_TOTAL: &str = "inventory_tasks_dispatched_total";

/// Counter for handlers that exited.
pub const TASKS_COMPLETED_TOTAL: &str = "inventory_tasks_completed_total";

/// Gauge for handlers currently in flight.
pub const QUEUE_DEPTH: &str = "inventory_queue_depth";

/// Counter for backpressure pauses raised by a dispatcher.
pub const BACKPRESSURE_PAUSES_TOTAL: &str = "inventory_backpressure_pauses_total";

// Source metrics

/// Counter for failed page fetches during enumeration.
pub const PAGE_ERRORS_TOTAL: &str = "inventory_source_page_errors_total";

/// Counter for assets emitted by the paged source.
pub const ASSETS_EMITTED_TOTAL: &str = "inventory_source_assets_emitted_total";

// Device query metrics

/// Histogram for device query latency in seconds.
pub const QUERY_DURATION_SECONDS: &str = "inventory_query_duration_seconds";

/// Counter for failed device queries.
pub const QUERY_ERRORS_TOTAL: &str = "inventory_query_errors_total";

// Stream and ledger metrics

/// Counter for stream operation failures (fetch, ack, nak, in_progress).
pub const STREAM_ERRORS_TOTAL: &str = "inventory_stream_errors_total";

/// Counter for dispositions applied to stream messages.
pub const EVENTS_HANDLED_TOTAL: &str = "inventory_events_handled_total";

/// Counter for stream messages acked without running a task.
pub const EVENTS_REJECTED_TOTAL: &str = "inventory_events_rejected_total";

/// Counter for ledger publishes that failed.
pub const LEDGER_PUBLISH_ERRORS_TOTAL: &str = "inventory_ledger_publish_errors_total";

pub(crate) fn task_dispatched(path: &'static str) {
    counter!(TASKS_DISPATCHED_TOTAL, PATH_LABEL => path).increment(1);
}

pub(crate) fn task_completed(path: &'static str) {
    counter!(TASKS_COMPLETED_TOTAL, PATH_LABEL => path).increment(1);
}

pub(crate) fn queue_depth(path: &'static str, depth: usize) {
    gauge!(QUEUE_DEPTH, PATH_LABEL => path).set(depth as f64);
}

pub(crate) fn backpressure_paused(path: &'static str) {
    counter!(BACKPRESSURE_PAUSES_TOTAL, PATH_LABEL => path).increment(1);
}

pub(crate) fn page_error() {
    counter!(PAGE_ERRORS_TOTAL).increment(1);
}

pub(crate) fn assets_emitted(count: usize) {
    counter!(ASSETS_EMITTED_TOTAL).increment(count as u64);
}

pub(crate) fn query_observed(query: &'static str, vendor: &str, model: &str, elapsed: Duration) {
    histogram!(
        QUERY_DURATION_SECONDS,
        QUERY_LABEL => query,
        VENDOR_LABEL => vendor.to_string(),
        MODEL_LABEL => model.to_string()
    )
    .record(elapsed.as_secs_f64());
}

pub(crate) fn query_failed(query: &'static str, vendor: &str, model: &str, kind: &'static str) {
    counter!(
        QUERY_ERRORS_TOTAL,
        QUERY_LABEL => query,
        VENDOR_LABEL => vendor.to_string(),
        MODEL_LABEL => model.to_string(),
        ERROR_KIND_LABEL => kind
    )
    .increment(1);
}

pub(crate) fn stream_error(operation: &'static str) {
    counter!(STREAM_ERRORS_TOTAL, OPERATION_LABEL => operation).increment(1);
}

pub(crate) fn event_handled(disposition: &'static str) {
    counter!(EVENTS_HANDLED_TOTAL, DISPOSITION_LABEL => disposition).increment(1);
}

pub(crate) fn event_rejected(reason: &'static str) {
    counter!(EVENTS_REJECTED_TOTAL, REASON_LABEL => reason).increment(1);
}

pub(crate) fn ledger_publish_failed(kind: &'static str) {
    counter!(LEDGER_PUBLISH_ERRORS_TOTAL, ERROR_KIND_LABEL => kind).increment(1);
}
