// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Polling informer over a key prefix.
//!
//! A [`StoreController`] periodically scans its prefix, compares each key's
//! version with the shared [`Cache`] and calls the matching
//! [`ResourceHandler`] callback. The cache only advances after a callback
//! succeeds, so a failed callback is retried on the next pass.
//!
//! Tombstones of keys the cache knows about are handled inline. Keys that
//! vanish without a visible tombstone are caught by the cache's sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::controller::{ControllerSpec, Reconciler};
use crate::error::{Error, Result};
use crate::manager::Manager;
use crate::store::{ChangeSource, KvSnapshot};

/// Default delay between two informer passes.
pub const DEFAULT_INFORMER_INTERVAL: Duration = Duration::from_secs(15);

/// Controller kind tag of informer controllers.
pub const INFORMER_KIND: &str = "informer";

/// Callbacks invoked by an informer for changes under its prefix.
#[async_trait]
pub trait ResourceHandler: Send + Sync + 'static {
    /// A key was seen live for the first time. Tombstones never produce an add.
    async fn on_add(&self, kv: &KvSnapshot) -> anyhow::Result<()>;

    /// A known key was seen with a higher version.
    async fn on_update(&self, kv: &KvSnapshot, previous_version: u64) -> anyhow::Result<()>;

    /// A known key was deleted, expired or vanished.
    async fn on_delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Informer for one key prefix.
pub struct StoreController {
    name: String,
    prefix: String,
    handler: Arc<dyn ResourceHandler>,
    cache: Arc<Cache>,
    source: Arc<dyn ChangeSource>,
    manager: Arc<Manager>,
    interval: Duration,
}

impl StoreController {
    /// Create an informer. Nothing runs until [`StoreController::run`].
    pub fn new(
        name: impl Into<String>,
        prefix: impl Into<String>,
        handler: Arc<dyn ResourceHandler>,
        cache: Arc<Cache>,
        source: Arc<dyn ChangeSource>,
        manager: Arc<Manager>,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            handler,
            cache,
            source,
            manager,
            interval: DEFAULT_INFORMER_INTERVAL,
        }
    }

    /// Set the delay between passes.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Controller name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Watched key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register with the cache and start the informer controller.
    ///
    /// Calling it again swaps in a fresh pass with the current settings.
    pub async fn run(&self) {
        self.cache
            .register_watcher(&self.manager, self.prefix.clone(), &self.handler)
            .await;

        let pass = InformerPass {
            name: self.name.clone(),
            prefix: self.prefix.clone(),
            handler: Arc::clone(&self.handler),
            cache: Arc::clone(&self.cache),
            source: Arc::clone(&self.source),
        };
        let spec = ControllerSpec::new(pass).with_interval(self.interval);
        self.manager
            .update_controller(self.name.clone(), INFORMER_KIND, spec)
            .await;

        info!(
            informer = %self.name,
            prefix = %self.prefix,
            interval_ms = self.interval.as_millis() as u64,
            "Informer started"
        );
    }

    /// Stop the informer controller and unregister from the cache, waiting
    /// for both loops to terminate.
    pub async fn stop(&self) -> Result<()> {
        match self.manager.remove_controller_and_wait(&self.name).await {
            Ok(()) | Err(Error::ControllerNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.cache
            .unregister_watcher(&self.manager, &self.prefix, &self.handler)
            .await?;
        info!(informer = %self.name, "Informer stopped");
        Ok(())
    }
}

impl std::fmt::Debug for StoreController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreController")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("cache", &self.cache.name())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct PassStats {
    added: usize,
    updated: usize,
    deleted: usize,
    failed: usize,
}

struct InformerPass {
    name: String,
    prefix: String,
    handler: Arc<dyn ResourceHandler>,
    cache: Arc<Cache>,
    source: Arc<dyn ChangeSource>,
}

impl InformerPass {
    async fn observe(&self, kv: &KvSnapshot, stats: &mut PassStats) {
        if kv.deleted_or_expired {
            // Unknown tombstones were never added, so there is nothing to delete.
            if !self.cache.check_if_exists(&kv.key).await {
                return;
            }
            match self.handler.on_delete(&kv.key).await {
                Ok(()) => {
                    self.cache.remove(&kv.key).await;
                    stats.deleted += 1;
                }
                Err(e) => {
                    warn!(informer = %self.name, key = %kv.key, error = %e, "on_delete failed");
                    stats.failed += 1;
                }
            }
            return;
        }

        if self.cache.check_if_added(&kv.key).await {
            if let Err(e) = self.handler.on_add(kv).await {
                warn!(informer = %self.name, key = %kv.key, error = %e, "on_add failed");
                stats.failed += 1;
                return;
            }
            stats.added += 1;
        } else if let Some(previous) = self.cache.version(&kv.key).await
            && previous < kv.version
        {
            if let Err(e) = self.handler.on_update(kv, previous).await {
                warn!(
                    informer = %self.name,
                    key = %kv.key,
                    version = kv.version,
                    error = %e,
                    "on_update failed"
                );
                stats.failed += 1;
                return;
            }
            stats.updated += 1;
        }

        self.cache.set(&kv.key, kv.version).await;
    }
}

#[async_trait]
impl Reconciler for InformerPass {
    async fn reconcile(&self, ctx: &CancellationToken) -> anyhow::Result<()> {
        let started = Instant::now();
        let snapshot = self.source.scan(&self.prefix).await?;

        let mut stats = PassStats::default();
        for kv in &snapshot {
            if ctx.is_cancelled() {
                debug!(informer = %self.name, "Pass interrupted by stop");
                break;
            }
            self.observe(kv, &mut stats).await;
        }

        debug!(
            informer = %self.name,
            scanned = snapshot.len(),
            added = stats.added,
            updated = stats.updated,
            deleted = stats.deleted,
            failed = stats.failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "Informer pass complete"
        );
        Ok(())
    }
}
