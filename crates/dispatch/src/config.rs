//! Worker configuration
//!
//! [`WorkerConfig`] carries every knob of an inventory worker and derives the
//! per-component configs handed to the source, dispatcher, consumer and
//! ledger.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::LedgerConfig;
use crate::worker::{ConsumerConfig, DispatcherConfig, SourceConfig};

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed
    #[error("invalid value {value:?} for {var}: {reason}")]
    Parse {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// A setting is out of range
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Inventory worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identity written into ledger records
    pub worker_id: String,

    /// Facility this worker collects for
    pub facility: String,

    /// Ceiling on concurrently running collections
    pub max_concurrency: usize,

    /// Assets per inventory store page
    pub page_size: usize,

    /// Messages pulled from the stream per fetch
    pub fetch_batch_size: usize,

    /// Hard deadline for one event-driven collection
    #[serde(with = "duration_millis")]
    pub task_timeout: Duration,

    /// Cadence of in-progress acknowledgements and ledger refreshes
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Redelivery timeout configured on the stream consumer
    #[serde(with = "duration_millis")]
    pub stream_ack_wait: Duration,

    /// Dispatcher control loop tick
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,

    /// How often a paused source re-checks the backpressure flag
    #[serde(with = "duration_millis")]
    pub pause_poll_interval: Duration,

    pub ledger: LedgerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            facility: "sandbox".to_string(),
            max_concurrency: 10,
            page_size: 100,
            fetch_batch_size: 5,
            task_timeout: Duration::from_secs(180 * 60),
            heartbeat_interval: Duration::from_secs(3 * 60),
            stream_ack_wait: Duration::from_secs(5 * 60),
            tick_interval: Duration::from_secs(1),
            pause_poll_interval: Duration::from_secs(1),
            ledger: LedgerConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create a configuration for a facility
    pub fn new(facility: impl Into<String>) -> Self {
        Self {
            facility: facility.into(),
            ..Default::default()
        }
    }

    /// Read configuration from environment variables
    ///
    /// Environment variables (all optional):
    /// - `WORKER_ID`, `FACILITY_CODE`, `LEDGER_BUCKET`
    /// - `MAX_CONCURRENCY`, `PAGE_SIZE`, `FETCH_BATCH_SIZE`
    /// - `TASK_TIMEOUT_SECS`, `HEARTBEAT_INTERVAL_SECS`, `STREAM_ACK_WAIT_SECS`
    /// - `LEDGER_STALE_THRESHOLD_SECS`, `LEDGER_RETENTION_SECS`
    ///
    /// The result is validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(id) = lookup("WORKER_ID") {
            config.worker_id = id;
        }
        if let Some(facility) = lookup("FACILITY_CODE") {
            config.facility = facility;
        }
        if let Some(bucket) = lookup("LEDGER_BUCKET") {
            config.ledger.bucket = bucket;
        }
        if let Some(n) = parse(&lookup, "MAX_CONCURRENCY")? {
            config.max_concurrency = n;
        }
        if let Some(n) = parse(&lookup, "PAGE_SIZE")? {
            config.page_size = n;
        }
        if let Some(n) = parse(&lookup, "FETCH_BATCH_SIZE")? {
            config.fetch_batch_size = n;
        }
        if let Some(secs) = parse(&lookup, "TASK_TIMEOUT_SECS")? {
            config.task_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "STREAM_ACK_WAIT_SECS")? {
            config.stream_ack_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "LEDGER_STALE_THRESHOLD_SECS")? {
            config.ledger.stale_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "LEDGER_RETENTION_SECS")? {
            config.ledger.retention = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the settings are usable together
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency", "must be at least 1"));
        }
        if self.page_size == 0 {
            return Err(invalid("page_size", "must be at least 1"));
        }
        if self.fetch_batch_size == 0 {
            return Err(invalid("fetch_batch_size", "must be at least 1"));
        }
        if self.facility.is_empty() {
            return Err(invalid("facility", "must not be empty"));
        }
        if self.ledger.bucket.is_empty() {
            return Err(invalid("ledger.bucket", "must not be empty"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat_interval", "must be positive"));
        }
        if self.heartbeat_interval >= self.stream_ack_wait {
            return Err(invalid(
                "heartbeat_interval",
                format!(
                    "{:?} must be shorter than the stream ack wait of {:?}",
                    self.heartbeat_interval, self.stream_ack_wait
                ),
            ));
        }
        if self.ledger.stale_threshold <= self.heartbeat_interval {
            return Err(invalid(
                "ledger.stale_threshold",
                "must be longer than the heartbeat interval",
            ));
        }
        Ok(())
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn with_fetch_batch_size(mut self, size: usize) -> Self {
        self.fetch_batch_size = size;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stream_ack_wait(mut self, wait: Duration) -> Self {
        self.stream_ack_wait = wait;
        self
    }

    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    pub fn with_ledger(mut self, ledger: LedgerConfig) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            page_size: self.page_size,
            pause_poll_interval: self.pause_poll_interval,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrency: self.max_concurrency,
            tick_interval: self.tick_interval,
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            facility: Some(self.facility.clone()),
            fetch_batch_size: self.fetch_batch_size,
            task_timeout: self.task_timeout,
            heartbeat_interval: self.heartbeat_interval,
            ..ConsumerConfig::default()
        }
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        self.ledger.clone()
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map(Some).map_err(|e| ConfigError::Parse {
                var,
                reason: e.to_string(),
                value,
            })
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.task_timeout, Duration::from_secs(10_800));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(180));
        assert_eq!(config.ledger.retention, Duration::from_secs(864_000));
        config.validate().unwrap();
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("WORKER_ID", "alloy-7"),
            ("FACILITY_CODE", "sjc1"),
            ("LEDGER_BUCKET", "inventory-tasks-sjc1"),
            ("MAX_CONCURRENCY", "25"),
            ("PAGE_SIZE", "50"),
            ("HEARTBEAT_INTERVAL_SECS", "30"),
            ("STREAM_ACK_WAIT_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.worker_id, "alloy-7");
        assert_eq!(config.facility, "sjc1");
        assert_eq!(config.ledger_config().bucket, "inventory-tasks-sjc1");
        assert_eq!(config.consumer_config().facility.as_deref(), Some("sjc1"));
        assert_eq!(config.dispatcher_config().max_concurrency, 25);
        assert_eq!(config.source_config().page_size, 50);
        assert_eq!(
            config.consumer_config().heartbeat_interval,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_unparseable_value() {
        let err = WorkerConfig::from_lookup(lookup(&[("PAGE_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { var: "PAGE_SIZE", .. }));
    }

    #[test]
    fn test_rejects_zero_limits() {
        let err = WorkerConfig::default().with_max_concurrency(0).validate();
        assert!(matches!(err, Err(ConfigError::Invalid { field: "max_concurrency", .. })));

        let err = WorkerConfig::default().with_page_size(0).validate();
        assert!(matches!(err, Err(ConfigError::Invalid { field: "page_size", .. })));
    }

    #[test]
    fn test_heartbeat_must_beat_ack_wait() {
        let config = WorkerConfig::default()
            .with_heartbeat_interval(Duration::from_secs(60))
            .with_stream_ack_wait(Duration::from_secs(60));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "heartbeat_interval", .. })
        ));
    }

    #[test]
    fn test_serde_durations_as_millis() {
        let config = WorkerConfig::default().with_tick_interval(Duration::from_millis(250));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["tick_interval"], 250);

        let back: WorkerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.tick_interval, Duration::from_millis(250));
    }
}
