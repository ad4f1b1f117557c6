//! The tracking table: one row per applied migration version.
//!
//! Mutating calls issue plain statements on the caller's connection, so they
//! commit or roll back with whatever transaction or savepoint is open.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::Client;

use crate::db::quote_ident;
use crate::error::{Result, TidemarkError};
use crate::migration::MigrationVersion;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A row from the tracking table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingRecord {
    pub version: String,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: i32,
}

/// Data written when a version becomes applied. `applied_at` is set by the database.
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
    pub version: &'a str,
    pub name: &'a str,
    pub checksum: &'a str,
    pub execution_time_ms: i32,
}

pub struct VersionStore<'a> {
    client: &'a Client,
    schema: String,
    table: String,
}

impl<'a> VersionStore<'a> {
    pub fn new(client: &'a Client, schema: &str, table: &str) -> Self {
        Self {
            client,
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    pub fn client(&self) -> &'a Client {
        self.client
    }

    fn fq(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Check if the tracking table exists.
    pub async fn exists(&self) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT FROM information_schema.tables
                    WHERE table_schema = $1 AND table_name = $2
                )",
                &[&self.schema, &self.table],
            )
            .await?;
        Ok(row.get::<_, bool>(0))
    }

    /// Create the schema and tracking table if missing. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<()> {
        let sql = format!(
            r#"
CREATE SCHEMA IF NOT EXISTS {schema};
CREATE TABLE IF NOT EXISTS {fq} (
    version           TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    checksum          TEXT NOT NULL,
    applied_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    execution_time_ms INTEGER NOT NULL DEFAULT 0
);
"#,
            schema = quote_ident(&self.schema),
            fq = self.fq(),
        );
        self.client.batch_execute(&sql).await?;
        Ok(())
    }

    /// All tracking records in version order. Empty when the table does not exist.
    pub async fn applied_records(&self) -> Result<Vec<TrackingRecord>> {
        if !self.exists().await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT version, name, checksum, applied_at, execution_time_ms FROM {}",
            self.fq()
        );
        let rows = self.client.query(&sql, &[]).await?;

        let mut records: Vec<TrackingRecord> = rows
            .iter()
            .map(|row| TrackingRecord {
                version: row.get(0),
                name: row.get(1),
                checksum: row.get(2),
                applied_at: row.get(3),
                execution_time_ms: row.get(4),
            })
            .collect();
        records.sort_by(|a, b| {
            MigrationVersion::new(a.version.as_str()).cmp(&MigrationVersion::new(b.version.as_str()))
        });
        Ok(records)
    }

    pub async fn applied_versions(&self) -> Result<Vec<String>> {
        Ok(self
            .applied_records()
            .await?
            .into_iter()
            .map(|r| r.version)
            .collect())
    }

    pub async fn is_applied(&self, version: &str) -> Result<bool> {
        if !self.exists().await? {
            return Ok(false);
        }
        let sql = format!("SELECT EXISTS (SELECT 1 FROM {} WHERE version = $1)", self.fq());
        let row = self.client.query_one(&sql, &[&version]).await?;
        Ok(row.get::<_, bool>(0))
    }

    /// Insert a tracking record. Fails with `AlreadyApplied` if the version is recorded.
    pub async fn record_applied(&self, record: &NewRecord<'_>) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (version, name, checksum, execution_time_ms) VALUES ($1, $2, $3, $4)",
            self.fq()
        );
        self.client
            .execute(
                &sql,
                &[
                    &record.version,
                    &record.name,
                    &record.checksum,
                    &record.execution_time_ms,
                ],
            )
            .await
            .map_err(|e| match e.as_db_error() {
                Some(db_err) if db_err.code().code() == "23505" => {
                    TidemarkError::AlreadyApplied(record.version.to_string())
                }
                _ => TidemarkError::DatabaseError(e),
            })?;
        Ok(())
    }

    /// Insert or overwrite the record for a version. Used by forced runs.
    pub async fn upsert_applied(&self, record: &NewRecord<'_>) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (version, name, checksum, execution_time_ms) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (version) DO UPDATE SET name = EXCLUDED.name, checksum = EXCLUDED.checksum, \
             applied_at = now(), execution_time_ms = EXCLUDED.execution_time_ms",
            self.fq()
        );
        self.client
            .execute(
                &sql,
                &[
                    &record.version,
                    &record.name,
                    &record.checksum,
                    &record.execution_time_ms,
                ],
            )
            .await?;
        Ok(())
    }

    /// Delete the record for a version. Returns whether a row was removed.
    pub async fn remove_applied(&self, version: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE version = $1", self.fq());
        let count = self.client.execute(&sql, &[&version]).await?;
        Ok(count > 0)
    }

    /// Delete every record.
    pub async fn clear(&self) -> Result<u64> {
        let sql = format!("DELETE FROM {}", self.fq());
        Ok(self.client.execute(&sql, &[]).await?)
    }

    /// Stable advisory lock id for this table, from CRC32 of `schema.table`.
    pub fn lock_id(&self) -> i64 {
        crc32fast::hash(format!("{}.{}", self.schema, self.table).as_bytes()) as i64
    }

    /// Take the session-level run lock, polling until `timeout` elapses.
    pub async fn acquire_run_lock(&self, timeout: Duration) -> Result<()> {
        let lock_id = self.lock_id();
        tracing::info!(lock_id = lock_id, table = %self.table, "Acquiring run lock");

        let deadline = Instant::now() + timeout;
        loop {
            let row = self
                .client
                .query_one("SELECT pg_try_advisory_lock($1)", &[&lock_id])
                .await
                .map_err(|e| TidemarkError::LockError(format!("Failed to acquire run lock: {}", e)))?;
            if row.get::<_, bool>(0) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::warn!(lock_id = lock_id, "Run lock is held by another session");
                return Err(TidemarkError::LockTimeout {
                    lock_id,
                    timeout_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    pub async fn release_run_lock(&self) -> Result<()> {
        let lock_id = self.lock_id();
        tracing::info!(lock_id = lock_id, table = %self.table, "Releasing run lock");
        self.client
            .execute("SELECT pg_advisory_unlock($1)", &[&lock_id])
            .await
            .map_err(|e| TidemarkError::LockError(format!("Failed to release run lock: {}", e)))?;
        Ok(())
    }
}
