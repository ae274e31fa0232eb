// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key/value storage contract and backends.
//!
//! The store offers request/response access only: no watch or subscribe.
//! Every write is stamped with a store-wide revision that only moves
//! forward. Deleting or expiring a key leaves a tombstone that prefix scans
//! still return (flagged `deleted_or_expired`) for a grace window; after the
//! window the key is gone and no scan will ever mention it again.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How long deleted or expired keys stay visible to scans by default.
pub const DEFAULT_TOMBSTONE_GRACE: Duration = Duration::from_secs(30);

/// Errors from storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The key does not exist (or is only a tombstone).
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The key already exists.
    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    /// The key is empty or otherwise unusable.
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Whether this error means the key was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound(_))
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// One key as returned by a read or prefix scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvSnapshot {
    /// Full key.
    pub key: String,
    /// Value bytes.
    pub data: Vec<u8>,
    /// Revision of the last write (including deletion) of this key.
    pub version: u64,
    /// When the key expires, if it was written with a TTL.
    pub expires_at: Option<DateTime<Utc>>,
    /// Tombstone flag: the key was deleted or has expired.
    pub deleted_or_expired: bool,
}

/// Lifecycle of a stored entry at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    Live,
    Tombstone,
    Gone,
}

/// Classify an entry from its deletion and expiry timestamps.
pub(crate) fn entry_state(
    deleted_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    grace: chrono::Duration,
    now: DateTime<Utc>,
) -> EntryState {
    let dead_since = deleted_at.or(expires_at.filter(|at| *at <= now));
    match dead_since {
        None => EntryState::Live,
        Some(since) if now < since + grace => EntryState::Tombstone,
        Some(_) => EntryState::Gone,
    }
}

pub(crate) fn grace_to_chrono(grace: Duration) -> chrono::Duration {
    chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Condition a write must satisfy against the current live state of its key.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Precondition {
    None,
    Absent,
    Present,
}

impl Precondition {
    pub(crate) fn check(self, key: &str, live: bool) -> Result<()> {
        match self {
            Precondition::Absent if live => Err(StoreError::AlreadyExists(key.to_string())),
            Precondition::Present if !live => Err(StoreError::KeyNotFound(key.to_string())),
            _ => Ok(()),
        }
    }
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Storage backend contract.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend identifier (e.g. "memory", "sqlite").
    fn store_type(&self) -> &'static str;

    /// Read a live key. Tombstones are reported as [`StoreError::KeyNotFound`].
    async fn get(&self, key: &str) -> Result<KvSnapshot>;

    /// Read a key including tombstones. `None` once the key is fully gone.
    async fn get_any(&self, key: &str) -> Result<Option<KvSnapshot>>;

    /// Write a key, returning its new version.
    async fn set(&self, key: &str, value: &[u8]) -> Result<u64>;

    /// Write a key that expires after `ttl`, returning its new version.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<u64>;

    /// Delete a live key, leaving a tombstone.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether a live key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Every key under `prefix`, live keys and tombstones, ordered by key.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvSnapshot>>;

    /// Write a key only if no live key exists.
    async fn create_only(&self, key: &str, value: &[u8]) -> Result<u64>;

    /// Write a key only if a live key already exists.
    async fn create_if_exists(&self, key: &str, value: &[u8]) -> Result<u64>;

    /// Visit every key under `prefix` until `visit` returns `false`.
    ///
    /// Returns the number of keys visited.
    async fn prefix_scan_with(
        &self,
        prefix: &str,
        visit: &mut (dyn for<'k> FnMut(&'k KvSnapshot) -> bool + Send),
    ) -> Result<usize> {
        let mut visited = 0;
        for kv in self.list_prefix(prefix).await? {
            visited += 1;
            if !visit(&kv) {
                break;
            }
        }
        Ok(visited)
    }
}

/// Source of change observations for informers.
///
/// Polling lives behind this trait so a backend with real push
/// notifications could feed the same reconciliation core.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// All keys under `prefix`, tombstones included.
    async fn scan(&self, prefix: &str) -> Result<Vec<KvSnapshot>>;

    /// Whether the key is still physically present (live or tombstoned).
    async fn is_present(&self, key: &str) -> Result<bool>;
}

#[async_trait]
impl<S: Store + ?Sized> ChangeSource for S {
    async fn scan(&self, prefix: &str) -> Result<Vec<KvSnapshot>> {
        self.list_prefix(prefix).await
    }

    async fn is_present(&self, key: &str) -> Result<bool> {
        Ok(self.get_any(key).await?.is_some())
    }
}

/// Polling change source over a shared, type-erased store.
#[derive(Clone)]
pub struct StoreChangeSource {
    store: Arc<dyn Store>,
}

impl StoreChangeSource {
    /// Wrap a shared store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChangeSource for StoreChangeSource {
    async fn scan(&self, prefix: &str) -> Result<Vec<KvSnapshot>> {
        self.store.list_prefix(prefix).await
    }

    async fn is_present(&self, key: &str) -> Result<bool> {
        Ok(self.store.get_any(key).await?.is_some())
    }
}
