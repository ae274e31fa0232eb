// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store.
//!
//! Rows are never removed by reads. Deleted and expired rows stay in
//! `kv_entries` as tombstones and are classified on every read; rows past
//! the grace window are invisible until [`SqliteStore::compact`] drops them.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use super::{
    DEFAULT_TOMBSTONE_GRACE, EntryState, KvSnapshot, Precondition, Result, Store, StoreError,
    entry_state, grace_to_chrono, validate_key,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const SELECT_ONE: &str = "SELECT key, value, version, expires_at, deleted_at \
     FROM kv_entries WHERE key = ?1";

const SELECT_PREFIX: &str = "SELECT key, value, version, expires_at, deleted_at \
     FROM kv_entries WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key";

#[derive(Debug, sqlx::FromRow)]
struct KvRow {
    key: String,
    value: Vec<u8>,
    version: i64,
    expires_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

/// SQLite implementation of [`Store`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    grace: chrono::Duration,
}

impl SqliteStore {
    /// Create a store over an existing pool.
    ///
    /// The schema must already exist; call [`SqliteStore::migrate`] otherwise.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            grace: grace_to_chrono(DEFAULT_TOMBSTONE_GRACE),
        }
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// Parent directories are created when missing.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Other(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        debug!(path = %path.display(), "Opened SQLite store");
        Ok(store)
    }

    /// Private in-memory database, mainly for tests.
    pub async fn in_memory() -> Result<Self> {
        // A single connection that is never recycled: each connection to
        // `sqlite::memory:` is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Set how long tombstones stay visible to scans.
    pub fn with_tombstone_grace(mut self, grace: Duration) -> Self {
        self.grace = grace_to_chrono(grace);
        self
    }

    /// Run schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Other(format!("Failed to run migrations: {}", e)))
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Delete every row whose tombstone grace window has passed.
    ///
    /// Returns the number of rows deleted.
    pub async fn compact(&self) -> Result<usize> {
        let now = Utc::now();
        let candidates: Vec<KvRow> = sqlx::query_as(
            "SELECT key, value, version, expires_at, deleted_at FROM kv_entries \
             WHERE deleted_at IS NOT NULL OR expires_at IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for row in candidates {
            if self.state(&row, now) != EntryState::Gone {
                continue;
            }
            // The version guard skips rows rewritten since the select.
            let result = sqlx::query("DELETE FROM kv_entries WHERE key = ?1 AND version = ?2")
                .bind(&row.key)
                .bind(row.version)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await?;

        if removed > 0 {
            debug!(removed, "Compacted SQLite store");
        }
        Ok(removed)
    }

    fn state(&self, row: &KvRow, now: DateTime<Utc>) -> EntryState {
        entry_state(row.deleted_at, row.expires_at, self.grace, now)
    }

    fn snapshot(row: KvRow, state: EntryState) -> KvSnapshot {
        KvSnapshot {
            key: row.key,
            data: row.value,
            version: row.version as u64,
            expires_at: row.expires_at,
            deleted_or_expired: state == EntryState::Tombstone,
        }
    }

    async fn read(&self, key: &str) -> Result<Option<(KvRow, EntryState)>> {
        let mut conn = self.pool.acquire().await?;
        let row = fetch_row(&mut conn, key).await?;
        let now = Utc::now();
        Ok(row
            .map(|row| {
                let state = self.state(&row, now);
                (row, state)
            })
            .filter(|(_, state)| *state != EntryState::Gone))
    }

    async fn write(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        precondition: Precondition,
    ) -> Result<u64> {
        validate_key(key)?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let version = next_revision(&mut tx).await?;

        let live = fetch_row(&mut tx, key)
            .await?
            .is_some_and(|row| self.state(&row, now) == EntryState::Live);
        precondition.check(key, live)?;

        let expires_at = ttl.map(|ttl| now + grace_to_chrono(ttl));
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, version, expires_at, deleted_at)
            VALUES (?1, ?2, ?3, ?4, NULL)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = excluded.version,
                expires_at = excluded.expires_at,
                deleted_at = NULL
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(version as i64)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(version)
    }
}

/// Take the next store revision.
///
/// Issued as the first statement of every write transaction so the
/// transaction holds the write lock from the start.
async fn next_revision(conn: &mut SqliteConnection) -> Result<u64> {
    let revision: i64 = sqlx::query_scalar(
        "UPDATE kv_revision SET revision = revision + 1 WHERE id = 1 RETURNING revision",
    )
    .fetch_one(&mut *conn)
    .await?;
    Ok(revision as u64)
}

async fn fetch_row(conn: &mut SqliteConnection, key: &str) -> Result<Option<KvRow>> {
    Ok(sqlx::query_as::<_, KvRow>(SELECT_ONE)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?)
}

#[async_trait]
impl Store for SqliteStore {
    fn store_type(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<KvSnapshot> {
        match self.read(key).await? {
            Some((row, EntryState::Live)) => Ok(Self::snapshot(row, EntryState::Live)),
            _ => Err(StoreError::KeyNotFound(key.to_string())),
        }
    }

    async fn get_any(&self, key: &str) -> Result<Option<KvSnapshot>> {
        Ok(self
            .read(key)
            .await?
            .map(|(row, state)| Self::snapshot(row, state)))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.write(key, value, None, Precondition::None).await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<u64> {
        self.write(key, value, Some(ttl), Precondition::None).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let version = next_revision(&mut tx).await?;

        let live = fetch_row(&mut tx, key)
            .await?
            .is_some_and(|row| self.state(&row, now) == EntryState::Live);
        if !live {
            return Err(StoreError::KeyNotFound(key.to_string()));
        }

        sqlx::query("UPDATE kv_entries SET deleted_at = ?1, version = ?2 WHERE key = ?3")
            .bind(now)
            .bind(version as i64)
            .bind(key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(matches!(self.read(key).await?, Some((_, EntryState::Live))))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvSnapshot>> {
        let rows: Vec<KvRow> = sqlx::query_as(SELECT_PREFIX)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?;

        let now = Utc::now();
        Ok(rows
            .into_iter()
            .filter_map(|row| match self.state(&row, now) {
                EntryState::Gone => None,
                state => Some(Self::snapshot(row, state)),
            })
            .collect())
    }

    async fn create_only(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.write(key, value, None, Precondition::Absent).await
    }

    async fn create_if_exists(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.write(key, value, None, Precondition::Present).await
    }
}
