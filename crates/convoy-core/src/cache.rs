// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Version cache shared by informers, with silent-delete detection.
//!
//! A prefix scan can only report keys that still physically exist. A key
//! whose tombstone aged out between two scans is simply missing, so the
//! cache runs its own sweep controller that checks every cached key and
//! hands the missing ones to the delete handler of the watcher whose prefix
//! matches (longest prefix wins).
//!
//! The sweep only removes an entry after `on_delete` succeeds. A failed
//! handler leaves the entry in place and is retried on the next sweep.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{ControllerSpec, Reconciler};
use crate::error::Result;
use crate::informer::ResourceHandler;
use crate::manager::Manager;
use crate::store::ChangeSource;

/// Default delay between two delete sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Controller kind tag of sweep controllers.
pub const SWEEP_KIND: &str = "cache-sweep";

struct Watcher {
    prefix: String,
    handler: Weak<dyn ResourceHandler>,
}

/// Map of key to the last version an informer processed successfully.
pub struct Cache {
    name: String,
    entries: Mutex<HashMap<String, u64>>,
    watchers: Mutex<Vec<Watcher>>,
    source: Arc<dyn ChangeSource>,
    sweep_interval: Duration,
}

impl Cache {
    /// Create an empty cache that checks keys through `source`.
    pub fn new(name: impl Into<String>, source: Arc<dyn ChangeSource>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            source,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Set the delay between delete sweeps.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of this cache's sweep controller.
    pub fn sweep_controller_name(&self) -> String {
        format!("{}:{}", SWEEP_KIND, self.name)
    }

    /// True iff the key has never been recorded.
    pub async fn check_if_added(&self, key: &str) -> bool {
        !self.entries.lock().await.contains_key(key)
    }

    /// True iff the key is recorded with a version strictly below `version`.
    pub async fn check_if_updated(&self, key: &str, version: u64) -> bool {
        self.entries
            .lock()
            .await
            .get(key)
            .is_some_and(|cached| *cached < version)
    }

    /// Whether the key is recorded.
    pub async fn check_if_exists(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    /// Recorded version of a key.
    pub async fn version(&self, key: &str) -> Option<u64> {
        self.entries.lock().await.get(key).copied()
    }

    /// Record a version. Never lowers an existing entry.
    pub async fn set(&self, key: &str, version: u64) {
        let mut entries = self.entries.lock().await;
        let cached = entries.entry(key.to_string()).or_insert(version);
        if *cached < version {
            *cached = version;
        }
    }

    /// Forget a key. Returns the version it had.
    pub async fn remove(&self, key: &str) -> Option<u64> {
        self.entries.lock().await.remove(key)
    }

    /// Number of recorded keys.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is recorded.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Recorded keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Register the delete handler for keys under `prefix`.
    ///
    /// The cache keeps only a weak handle. The sweep controller is started
    /// with the first registration.
    pub async fn register_watcher(
        self: &Arc<Self>,
        manager: &Manager,
        prefix: impl Into<String>,
        handler: &Arc<dyn ResourceHandler>,
    ) {
        let prefix = prefix.into();
        let first = {
            let mut watchers = self.watchers.lock().await;
            watchers.retain(|w| w.handler.strong_count() > 0);
            watchers.push(Watcher {
                prefix: prefix.clone(),
                handler: Arc::downgrade(handler),
            });
            watchers.len() == 1
        };
        debug!(cache = %self.name, prefix = %prefix, "Registered cache watcher");

        if first {
            self.start_sweep(manager).await;
        }
    }

    /// Drop the watcher registered for `prefix` with `handler`.
    ///
    /// Stops the sweep controller, and waits for it, once no watcher is left.
    pub async fn unregister_watcher(
        &self,
        manager: &Manager,
        prefix: &str,
        handler: &Arc<dyn ResourceHandler>,
    ) -> Result<()> {
        let target = Arc::downgrade(handler);
        let last = {
            let mut watchers = self.watchers.lock().await;
            let before = watchers.len();
            watchers.retain(|w| {
                w.handler.strong_count() > 0
                    && !(w.prefix == prefix && Weak::ptr_eq(&w.handler, &target))
            });
            before > 0 && watchers.is_empty()
        };
        debug!(cache = %self.name, prefix = %prefix, "Unregistered cache watcher");

        if last {
            self.stop_sweep(manager).await?;
        }
        Ok(())
    }

    /// Number of live watchers.
    pub async fn watcher_count(&self) -> usize {
        self.watchers
            .lock()
            .await
            .iter()
            .filter(|w| w.handler.strong_count() > 0)
            .count()
    }

    /// Start (or wake) the sweep controller.
    pub async fn start_sweep(self: &Arc<Self>, manager: &Manager) {
        let spec = ControllerSpec::new(Sweep {
            cache: Arc::clone(self),
        })
        .with_interval(self.sweep_interval)
        .with_error_retry_base(self.sweep_interval);

        if manager
            .update_controller(self.sweep_controller_name(), SWEEP_KIND, spec)
            .await
        {
            info!(
                cache = %self.name,
                interval_ms = self.sweep_interval.as_millis() as u64,
                "Cache sweep started"
            );
        }
    }

    /// Stop the sweep controller and wait for it. A no-op when not running.
    pub async fn stop_sweep(&self, manager: &Manager) -> Result<()> {
        let name = self.sweep_controller_name();
        if !manager.contains(&name).await {
            return Ok(());
        }
        manager.remove_controller_and_wait(&name).await?;
        info!(cache = %self.name, "Cache sweep stopped");
        Ok(())
    }

    /// Delete handler whose prefix is the longest match for `key`.
    async fn handler_for(&self, key: &str) -> Option<Arc<dyn ResourceHandler>> {
        let watchers = self.watchers.lock().await;
        watchers
            .iter()
            .filter(|w| key.starts_with(&w.prefix))
            .filter_map(|w| w.handler.upgrade().map(|h| (w.prefix.len(), h)))
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler)
    }

    /// Check every cached key once and dispatch deletes for missing keys.
    ///
    /// Returns the number of keys whose handling failed.
    async fn sweep(&self, ctx: &CancellationToken) -> usize {
        let mut failed = 0;
        let mut deleted = 0;

        for key in self.keys().await {
            if ctx.is_cancelled() {
                break;
            }

            match self.source.is_present(&key).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(cache = %self.name, key = %key, error = %e, "Existence check failed");
                    failed += 1;
                    continue;
                }
            }

            let Some(handler) = self.handler_for(&key).await else {
                debug!(cache = %self.name, key = %key, "No watcher for vanished key, forgetting it");
                self.remove(&key).await;
                continue;
            };

            match handler.on_delete(&key).await {
                Ok(()) => {
                    self.remove(&key).await;
                    deleted += 1;
                    info!(cache = %self.name, key = %key, "Detected silent delete");
                }
                Err(e) => {
                    warn!(
                        cache = %self.name,
                        key = %key,
                        error = %e,
                        "Delete handler failed, will retry on next sweep"
                    );
                    failed += 1;
                }
            }
        }

        if deleted > 0 || failed > 0 {
            debug!(cache = %self.name, deleted, failed, "Cache sweep finished");
        }
        failed
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("sweep_interval", &self.sweep_interval)
            .finish_non_exhaustive()
    }
}

struct Sweep {
    cache: Arc<Cache>,
}

#[async_trait]
impl Reconciler for Sweep {
    async fn reconcile(&self, ctx: &CancellationToken) -> anyhow::Result<()> {
        match self.cache.sweep(ctx).await {
            0 => Ok(()),
            failed => Err(anyhow!("{} cached keys could not be reconciled", failed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvSnapshot, MemoryStore, Store};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDeletes {
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl ResourceHandler for CountingDeletes {
        async fn on_add(&self, _kv: &KvSnapshot) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_update(&self, _kv: &KvSnapshot, _previous: u64) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_delete(&self, _key: &str) -> anyhow::Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn empty_cache() -> Arc<Cache> {
        Arc::new(Cache::new("test", Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn test_add_and_update_checks() {
        let cache = empty_cache();

        assert!(cache.check_if_added("k").await);
        assert!(!cache.check_if_updated("k", 1).await);

        cache.set("k", 5).await;
        assert!(!cache.check_if_added("k").await);
        assert!(cache.check_if_exists("k").await);
        assert!(cache.check_if_updated("k", 6).await);
        assert!(!cache.check_if_updated("k", 5).await);
        assert!(!cache.check_if_updated("k", 4).await);
    }

    #[tokio::test]
    async fn test_set_never_lowers_version() {
        let cache = empty_cache();
        cache.set("k", 7).await;
        cache.set("k", 3).await;
        assert_eq!(cache.version("k").await, Some(7));

        assert_eq!(cache.remove("k").await, Some(7));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let cache = empty_cache();
        let manager = Manager::new();
        let broad: Arc<dyn ResourceHandler> = Arc::new(CountingDeletes::default());
        let narrow: Arc<dyn ResourceHandler> = Arc::new(CountingDeletes::default());

        cache.register_watcher(&manager, "a/", &broad).await;
        cache.register_watcher(&manager, "a/b/", &narrow).await;

        let picked = cache.handler_for("a/b/c").await.unwrap();
        assert!(Arc::ptr_eq(&picked, &narrow));
        let picked = cache.handler_for("a/x").await.unwrap();
        assert!(Arc::ptr_eq(&picked, &broad));
        assert!(cache.handler_for("z").await.is_none());

        manager.remove_all_and_wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_lifecycle_follows_watchers() {
        let cache = empty_cache();
        let manager = Manager::new();
        let first: Arc<dyn ResourceHandler> = Arc::new(CountingDeletes::default());
        let second: Arc<dyn ResourceHandler> = Arc::new(CountingDeletes::default());

        cache.register_watcher(&manager, "a/", &first).await;
        assert!(manager.contains("cache-sweep:test").await);
        cache.register_watcher(&manager, "b/", &second).await;
        assert_eq!(manager.len().await, 1);

        cache.unregister_watcher(&manager, "a/", &first).await.unwrap();
        assert!(manager.contains("cache-sweep:test").await);

        cache.unregister_watcher(&manager, "b/", &second).await.unwrap();
        assert!(!manager.contains("cache-sweep:test").await);
        assert_eq!(cache.watcher_count().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_detects_missing_keys() {
        let store = Arc::new(MemoryStore::new());
        store.set("a/live", b"").await.unwrap();
        let cache = Arc::new(Cache::new("test", store.clone()));
        let counting = Arc::new(CountingDeletes::default());
        let handler: Arc<dyn ResourceHandler> = counting.clone();
        let manager = Manager::new();
        cache.register_watcher(&manager, "a/", &handler).await;
        manager.remove_all_and_wait().await.unwrap();

        cache.set("a/live", 1).await;
        cache.set("a/gone", 2).await;

        let failed = cache.sweep(&CancellationToken::new()).await;
        assert_eq!(failed, 0);
        assert_eq!(counting.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(cache.keys().await, vec!["a/live".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_handler_is_not_called() {
        let cache = empty_cache();
        let manager = Manager::new();
        {
            let handler: Arc<dyn ResourceHandler> = Arc::new(CountingDeletes::default());
            cache.register_watcher(&manager, "a/", &handler).await;
        }
        manager.remove_all_and_wait().await.unwrap();

        cache.set("a/1", 1).await;
        assert_eq!(cache.sweep(&CancellationToken::new()).await, 0);
        assert!(cache.is_empty().await);
        assert_eq!(cache.watcher_count().await, 0);
    }
}
