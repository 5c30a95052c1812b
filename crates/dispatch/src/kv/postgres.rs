//! PostgreSQL implementation of KeyValueStore
//!
//! Buckets share one table keyed by `(bucket, key)`:
//! - Revisions come from a single sequence, so they increase on every write
//! - Create-if-absent is an upsert that only overwrites expired rows
//! - Compare-and-swap is a conditional `UPDATE ... WHERE revision = $n`

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};

use super::store::{KeyValueStore, KvEntry, KvError};

/// PostgreSQL-backed bucket
///
/// # Example
///
/// ```ignore
/// use inventory_dispatch::kv::PostgresKeyValueStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/inventory").await?;
/// PostgresKeyValueStore::migrate(&pool).await?;
/// let kv = PostgresKeyValueStore::bind(pool, "inventory-tasks", None).await?;
/// ```
#[derive(Clone)]
pub struct PostgresKeyValueStore {
    pool: PgPool,
    bucket: String,
    max_age: Option<Duration>,
}

impl PostgresKeyValueStore {
    /// Apply the bundled schema migrations
    pub async fn migrate(pool: &PgPool) -> Result<(), KvError> {
        info!("applying inventory kv migrations");
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Bind to a bucket
    ///
    /// Fails with [`KvError::BucketNotFound`] when the schema has not been
    /// migrated.
    pub async fn bind(
        pool: PgPool,
        bucket: impl Into<String>,
        max_age: Option<Duration>,
    ) -> Result<Self, KvError> {
        let bucket = bucket.into();

        let exists: bool = sqlx::query_scalar("SELECT to_regclass('inventory_kv') IS NOT NULL")
            .fetch_one(&pool)
            .await
            .map_err(backend("bind bucket"))?;
        if !exists {
            return Err(KvError::BucketNotFound(bucket));
        }

        debug!(%bucket, ?max_age, "bound kv bucket");
        Ok(Self {
            pool,
            bucket,
            max_age,
        })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete rows older than the bucket's max age
    ///
    /// Returns the number of rows removed; zero when the bucket never expires.
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn purge_expired(&self) -> Result<u64, KvError> {
        let Some(cutoff) = self.cutoff() else {
            return Ok(0);
        };

        let result = sqlx::query("DELETE FROM inventory_kv WHERE bucket = $1 AND updated_at < $2")
            .bind(&self.bucket)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(backend("purge expired"))?;

        debug!(purged = result.rows_affected(), "purged expired entries");
        Ok(result.rows_affected())
    }

    fn cutoff(&self) -> Option<DateTime<Utc>> {
        let age = chrono::Duration::from_std(self.max_age?).ok()?;
        Some(Utc::now() - age)
    }
}

fn backend(operation: &'static str) -> impl Fn(sqlx::Error) -> KvError {
    move |e| {
        error!("Failed to {}: {}", operation, e);
        KvError::Backend(e.to_string())
    }
}

#[async_trait]
impl KeyValueStore for PostgresKeyValueStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self, value), fields(bucket = %self.bucket))]
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        let row = sqlx::query(
            r#"
            INSERT INTO inventory_kv (bucket, key, value, revision, updated_at)
            VALUES ($1, $2, $3, nextval('inventory_kv_revision_seq'), NOW())
            ON CONFLICT (bucket, key) DO UPDATE SET
                value = EXCLUDED.value,
                revision = EXCLUDED.revision,
                updated_at = EXCLUDED.updated_at
            WHERE $4::timestamptz IS NOT NULL AND inventory_kv.updated_at < $4
            RETURNING revision
            "#,
        )
        .bind(&self.bucket)
        .bind(key)
        .bind(&value)
        .bind(self.cutoff())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend("create kv entry"))?
        .ok_or_else(|| KvError::KeyExists(key.to_string()))?;

        let revision: i64 = row.get("revision");
        debug!(%key, revision, "created kv entry");
        Ok(revision as u64)
    }

    #[instrument(skip(self, value), fields(bucket = %self.bucket))]
    async fn update(&self, key: &str, value: Vec<u8>, expected: u64) -> Result<u64, KvError> {
        let row = sqlx::query(
            r#"
            UPDATE inventory_kv
            SET value = $3,
                revision = nextval('inventory_kv_revision_seq'),
                updated_at = NOW()
            WHERE bucket = $1 AND key = $2 AND revision = $4
              AND ($5::timestamptz IS NULL OR updated_at >= $5)
            RETURNING revision
            "#,
        )
        .bind(&self.bucket)
        .bind(key)
        .bind(&value)
        .bind(expected as i64)
        .bind(self.cutoff())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend("update kv entry"))?;

        match row {
            Some(row) => {
                let revision: i64 = row.get("revision");
                debug!(%key, revision, "updated kv entry");
                Ok(revision as u64)
            }
            None => match self.get(key).await? {
                Some(current) => Err(KvError::RevisionMismatch {
                    key: key.to_string(),
                    expected,
                    actual: current.revision,
                }),
                None => Err(KvError::NotFound(key.to_string())),
            },
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        let row = sqlx::query(
            r#"
            SELECT value, revision, updated_at
            FROM inventory_kv
            WHERE bucket = $1 AND key = $2
              AND ($3::timestamptz IS NULL OR updated_at >= $3)
            "#,
        )
        .bind(&self.bucket)
        .bind(key)
        .bind(self.cutoff())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend("get kv entry"))?;

        Ok(row.map(|row| {
            let revision: i64 = row.get("revision");
            KvEntry {
                key: key.to_string(),
                value: row.get("value"),
                revision: revision as u64,
                updated_at: row.get("updated_at"),
            }
        }))
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT key
            FROM inventory_kv
            WHERE bucket = $1 AND left(key, length($2)) = $2
              AND ($3::timestamptz IS NULL OR updated_at >= $3)
            ORDER BY key
            "#,
        )
        .bind(&self.bucket)
        .bind(prefix)
        .bind(self.cutoff())
        .fetch_all(&self.pool)
        .await
        .map_err(backend("list kv keys"))?;

        Ok(keys)
    }
}
