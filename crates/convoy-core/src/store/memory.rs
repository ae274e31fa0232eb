// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process store.
//!
//! Used by tests and single-process deployments. Tombstones past their
//! grace window are dropped lazily on the next access, which is exactly the
//! "silent deletion" an informer can only notice by probing.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    DEFAULT_TOMBSTONE_GRACE, EntryState, KvSnapshot, Precondition, Result, Store, StoreError,
    entry_state, grace_to_chrono, validate_key,
};

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    version: u64,
    expires_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    revision: u64,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

/// In-memory [`Store`] implementation.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    grace: chrono::Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with the default tombstone grace window.
    pub fn new() -> Self {
        Self::with_tombstone_grace(DEFAULT_TOMBSTONE_GRACE)
    }

    /// Create an empty store whose tombstones stay visible for `grace`.
    pub fn with_tombstone_grace(grace: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            grace: grace_to_chrono(grace),
        }
    }

    /// Remove a key outright, without leaving a tombstone.
    ///
    /// Returns whether the key was present.
    pub async fn purge(&self, key: &str) -> bool {
        self.inner.lock().await.entries.remove(key).is_some()
    }

    /// Drop every entry whose tombstone grace window has passed.
    ///
    /// Returns the number of entries dropped.
    pub async fn compact(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| {
            entry_state(e.deleted_at, e.expires_at, self.grace, now) != EntryState::Gone
        });
        before - inner.entries.len()
    }

    /// Current store revision.
    pub async fn revision(&self) -> u64 {
        self.inner.lock().await.revision
    }

    fn state(&self, entry: &Entry, now: DateTime<Utc>) -> EntryState {
        entry_state(entry.deleted_at, entry.expires_at, self.grace, now)
    }

    fn snapshot(key: &str, entry: &Entry, state: EntryState) -> KvSnapshot {
        KvSnapshot {
            key: key.to_string(),
            data: entry.data.clone(),
            version: entry.version,
            expires_at: entry.expires_at,
            deleted_or_expired: state == EntryState::Tombstone,
        }
    }

    /// Look up an entry, dropping it if its grace window has passed.
    fn lookup<'a>(
        &self,
        inner: &'a mut Inner,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<(&'a Entry, EntryState)> {
        let state = self.state(inner.entries.get(key)?, now);
        if state == EntryState::Gone {
            inner.entries.remove(key);
            return None;
        }
        inner.entries.get(key).map(|entry| (entry, state))
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
        let mut inner = self.inner.lock().await;

        let live = matches!(
            self.lookup(&mut inner, key, now),
            Some((_, EntryState::Live))
        );
        precondition.check(key, live)?;

        let expires_at = match ttl {
            Some(ttl) => Some(now + grace_to_chrono(ttl)),
            None => None,
        };
        let version = inner.next_revision();
        inner.entries.insert(
            key.to_string(),
            Entry {
                data: value.to_vec(),
                version,
                expires_at,
                deleted_at: None,
            },
        );
        Ok(version)
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn store_type(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<KvSnapshot> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        match self.lookup(&mut inner, key, now) {
            Some((entry, EntryState::Live)) => Ok(Self::snapshot(key, entry, EntryState::Live)),
            _ => Err(StoreError::KeyNotFound(key.to_string())),
        }
    }

    async fn get_any(&self, key: &str) -> Result<Option<KvSnapshot>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        Ok(self
            .lookup(&mut inner, key, now)
            .map(|(entry, state)| Self::snapshot(key, entry, state)))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.write(key, value, None, Precondition::None).await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<u64> {
        self.write(key, value, Some(ttl), Precondition::None).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        if !matches!(self.lookup(&mut inner, key, now), Some((_, EntryState::Live))) {
            return Err(StoreError::KeyNotFound(key.to_string()));
        }

        let version = inner.next_revision();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.deleted_at = Some(now);
            entry.version = version;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        Ok(matches!(
            self.lookup(&mut inner, key, now),
            Some((_, EntryState::Live))
        ))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvSnapshot>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let mut gone = Vec::new();
        let mut result = Vec::new();
        for (key, entry) in inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            match self.state(entry, now) {
                EntryState::Gone => gone.push(key.clone()),
                state => result.push(Self::snapshot(key, entry, state)),
            }
        }

        for key in gone {
            inner.entries.remove(&key);
        }
        Ok(result)
    }

    async fn create_only(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.write(key, value, None, Precondition::Absent).await
    }

    async fn create_if_exists(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.write(key, value, None, Precondition::Present).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_and_versions_increase() {
        let store = MemoryStore::new();

        let v1 = store.set("a/1", b"one").await.unwrap();
        let v2 = store.set("a/1", b"uno").await.unwrap();
        assert!(v2 > v1);

        let kv = store.get("a/1").await.unwrap();
        assert_eq!(kv.data, b"uno");
        assert_eq!(kv.version, v2);
        assert!(!kv.deleted_or_expired);
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone() {
        let store = MemoryStore::new();
        let v1 = store.set("a/1", b"one").await.unwrap();
        store.delete("a/1").await.unwrap();

        assert!(store.get("a/1").await.unwrap_err().is_not_found());
        assert!(!store.exists("a/1").await.unwrap());

        let listed = store.list_prefix("a/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].deleted_or_expired);
        assert!(listed[0].version > v1);

        // Deleting a tombstone is a not-found error.
        assert!(store.delete("a/1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_tombstone_disappears_after_grace() {
        let store = MemoryStore::with_tombstone_grace(Duration::ZERO);
        store.set("a/1", b"one").await.unwrap();
        store.delete("a/1").await.unwrap();

        assert!(store.list_prefix("a/").await.unwrap().is_empty());
        assert!(store.get_any("a/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_is_silent() {
        let store = MemoryStore::new();
        store.set("a/1", b"one").await.unwrap();

        assert!(store.purge("a/1").await);
        assert!(store.list_prefix("a/").await.unwrap().is_empty());
        assert!(!store.purge("a/1").await);
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_flagged() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("a/1", b"one", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!store.exists("a/1").await.unwrap());
        let kv = store.get_any("a/1").await.unwrap().unwrap();
        assert!(kv.deleted_or_expired);
        assert!(kv.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_prefix_scan_is_bounded_by_prefix() {
        let store = MemoryStore::new();
        store.set("a/1", b"").await.unwrap();
        store.set("a/2", b"").await.unwrap();
        store.set("ab", b"").await.unwrap();
        store.set("b/1", b"").await.unwrap();

        let keys: Vec<_> = store
            .list_prefix("a/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
    }

    #[tokio::test]
    async fn test_prefix_scan_with_stops_early() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.set(&format!("k/{}", i), b"").await.unwrap();
        }

        let mut seen = Vec::new();
        let visited = store
            .prefix_scan_with("k/", &mut |kv: &KvSnapshot| {
                seen.push(kv.key.clone());
                seen.len() < 2
            })
            .await
            .unwrap();

        assert_eq!(visited, 2);
        assert_eq!(seen, vec!["k/0", "k/1"]);
    }

    #[tokio::test]
    async fn test_create_only_and_create_if_exists() {
        let store = MemoryStore::new();

        assert!(store.create_if_exists("a", b"x").await.unwrap_err().is_not_found());
        store.create_only("a", b"x").await.unwrap();
        assert!(matches!(
            store.create_only("a", b"y").await,
            Err(StoreError::AlreadyExists(_))
        ));
        store.create_if_exists("a", b"z").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().data, b"z");

        // A tombstoned key may be created again.
        store.delete("a").await.unwrap();
        store.create_only("a", b"again").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.set("", b"x").await,
            Err(StoreError::InvalidKey(_))
        ));
    }
}
