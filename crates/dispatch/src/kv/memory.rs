//! In-memory implementation of KeyValueStore for testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::store::{KeyValueStore, KvEntry, KvError};

struct Slot {
    value: Vec<u8>,
    revision: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Bucket {
    entries: HashMap<String, Slot>,
    // Bucket-wide sequence, so revisions also order writes across keys.
    sequence: u64,
}

impl Bucket {
    fn next_revision(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

/// In-memory implementation of KeyValueStore
///
/// Provides the same semantics as the PostgreSQL bucket: store-assigned
/// revisions, create-if-absent, compare-and-swap update and max-age expiry.
///
/// # Example
///
/// ```
/// use inventory_dispatch::kv::InMemoryKeyValueStore;
///
/// let kv = InMemoryKeyValueStore::new("inventory-tasks");
/// assert_eq!(kv.len(), 0);
/// ```
pub struct InMemoryKeyValueStore {
    name: String,
    max_age: Option<Duration>,
    bucket: RwLock<Bucket>,
    outage: RwLock<Option<String>>,
}

impl InMemoryKeyValueStore {
    /// Create an empty bucket without expiry
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_age: None,
            bucket: RwLock::new(Bucket::default()),
            outage: RwLock::new(None),
        }
    }

    /// Expire entries older than `max_age`
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let bucket = self.bucket.read();
        let now = Utc::now();
        bucket
            .entries
            .values()
            .filter(|slot| self.is_live(slot, now))
            .count()
    }

    /// Whether the bucket has no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every operation fail with a backend error until [`restore`](Self::restore)
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.outage.write() = Some(reason.into());
    }

    /// End a simulated outage
    pub fn restore(&self) {
        *self.outage.write() = None;
    }

    /// Move an entry's write time into the past
    pub fn backdate(&self, key: &str, by: Duration) {
        if let Some(slot) = self.bucket.write().entries.get_mut(key) {
            if let Ok(by) = chrono::Duration::from_std(by) {
                slot.updated_at -= by;
            }
        }
    }

    fn check_available(&self) -> Result<(), KvError> {
        match self.outage.read().as_ref() {
            Some(reason) => Err(KvError::Backend(reason.clone())),
            None => Ok(()),
        }
    }

    fn is_live(&self, slot: &Slot, now: DateTime<Utc>) -> bool {
        match self.max_age.and_then(|age| chrono::Duration::from_std(age).ok()) {
            Some(age) => now - slot.updated_at < age,
            None => true,
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    fn bucket(&self) -> &str {
        &self.name
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        self.check_available()?;
        let now = Utc::now();
        let mut bucket = self.bucket.write();

        if let Some(slot) = bucket.entries.get(key) {
            if self.is_live(slot, now) {
                return Err(KvError::KeyExists(key.to_string()));
            }
        }

        let revision = bucket.next_revision();
        bucket.entries.insert(
            key.to_string(),
            Slot {
                value,
                revision,
                updated_at: now,
            },
        );
        Ok(revision)
    }

    async fn update(&self, key: &str, value: Vec<u8>, expected: u64) -> Result<u64, KvError> {
        self.check_available()?;
        let now = Utc::now();
        let mut bucket = self.bucket.write();

        let current = match bucket.entries.get(key) {
            Some(slot) if self.is_live(slot, now) => slot.revision,
            _ => return Err(KvError::NotFound(key.to_string())),
        };
        if current != expected {
            return Err(KvError::RevisionMismatch {
                key: key.to_string(),
                expected,
                actual: current,
            });
        }

        let revision = bucket.next_revision();
        if let Some(slot) = bucket.entries.get_mut(key) {
            slot.value = value;
            slot.revision = revision;
            slot.updated_at = now;
        }
        Ok(revision)
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        self.check_available()?;
        let now = Utc::now();
        let bucket = self.bucket.read();

        Ok(bucket
            .entries
            .get(key)
            .filter(|slot| self.is_live(slot, now))
            .map(|slot| KvEntry {
                key: key.to_string(),
                value: slot.value.clone(),
                revision: slot.revision,
                updated_at: slot.updated_at,
            }))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        self.check_available()?;
        let now = Utc::now();
        let bucket = self.bucket.read();

        let mut keys: Vec<String> = bucket
            .entries
            .iter()
            .filter(|(key, slot)| key.starts_with(prefix) && self.is_live(slot, now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
