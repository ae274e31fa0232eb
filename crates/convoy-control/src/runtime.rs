// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable control plane runtime.
//!
//! [`ControlPlane`] wires the store, the shared cache, the scheduler and
//! the workflow informer together inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use convoy_control::agent::StaticAgentDirectory;
//! use convoy_control::runtime::ControlPlane;
//! use convoy_core::store::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     convoy_control::runtime::init_tracing();
//!     let store = Arc::new(SqliteStore::from_path(".data/convoy.db").await?);
//!     let directory = Arc::new(StaticAgentDirectory::new());
//!
//!     let control = ControlPlane::builder()
//!         .store(store)
//!         .directory(directory)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... submit workflows through control.workflows() ...
//!
//!     control.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use convoy_core::cache::DEFAULT_SWEEP_INTERVAL;
use convoy_core::informer::DEFAULT_INFORMER_INTERVAL;
use convoy_core::store::{SqliteStore, StoreChangeSource};
use convoy_core::{Cache, ChangeSource, ControllerStatus, Manager, Store, StoreController};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::{AgentDirectory, AgentHealth};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::placement::{PlacementKind, PlacementPolicy};
use crate::repository::WorkflowStore;
use crate::scheduler::{DEFAULT_DISPATCH_TIMEOUT, Scheduler};
use crate::workflow::WORKFLOW_PREFIX;
use crate::workflow_controller::WorkflowController;

/// Name of the workflow informer controller.
pub const WORKFLOW_INFORMER: &str = "workflow-informer";

/// Name of the cache shared by the control plane's informers.
pub const SHARED_CACHE: &str = "control-plane";

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`; defaults to info for the convoy crates. Does nothing
/// if a subscriber is already installed.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("convoy_core=info,convoy_control=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Builder for creating a [`ControlPlane`].
pub struct ControlPlaneBuilder {
    store: Option<Arc<dyn Store>>,
    directory: Option<Arc<dyn AgentDirectory>>,
    placement: Option<Arc<dyn PlacementPolicy>>,
    informer_interval: Duration,
    cache_sweep_interval: Duration,
    dispatch_timeout: Duration,
}

impl std::fmt::Debug for ControlPlaneBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneBuilder")
            .field("store", &self.store.as_ref().map(|s| s.store_type()))
            .field("directory", &self.directory.as_ref().map(|_| "..."))
            .field("placement", &self.placement.as_ref().map(|p| p.name()))
            .field("informer_interval", &self.informer_interval)
            .field("cache_sweep_interval", &self.cache_sweep_interval)
            .field("dispatch_timeout", &self.dispatch_timeout)
            .finish()
    }
}

impl Default for ControlPlaneBuilder {
    fn default() -> Self {
        Self {
            store: None,
            directory: None,
            placement: None,
            informer_interval: DEFAULT_INFORMER_INTERVAL,
            cache_sweep_interval: DEFAULT_SWEEP_INTERVAL,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }
}

impl ControlPlaneBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply intervals, deadline and placement from a [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.informer_interval = config.informer_interval;
        self.cache_sweep_interval = config.cache_sweep_interval;
        self.dispatch_timeout = config.dispatch_timeout;
        self.placement = Some(config.placement.build());
        self
    }

    /// Set the store holding manifests and status (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the agent directory (required).
    pub fn directory(mut self, directory: Arc<dyn AgentDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Set the placement policy.
    ///
    /// Default: round-robin.
    pub fn placement(mut self, placement: Arc<dyn PlacementPolicy>) -> Self {
        self.placement = Some(placement);
        self
    }

    /// Set the delay between workflow informer passes.
    ///
    /// Default: 15 seconds
    pub fn informer_interval(mut self, interval: Duration) -> Self {
        self.informer_interval = interval;
        self
    }

    /// Set the delay between cache delete sweeps.
    ///
    /// Default: 30 seconds
    pub fn cache_sweep_interval(mut self, interval: Duration) -> Self {
        self.cache_sweep_interval = interval;
        self
    }

    /// Set the deadline of each agent call.
    ///
    /// Default: 30 seconds
    pub fn dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControlPlaneConfig> {
        let store = self
            .store
            .ok_or_else(|| Error::Other("store is required".to_string()))?;
        let directory = self
            .directory
            .ok_or_else(|| Error::Other("agent directory is required".to_string()))?;
        if self.dispatch_timeout.is_zero() {
            return Err(Error::Other("dispatch timeout must be greater than zero".to_string()));
        }

        Ok(ControlPlaneConfig {
            store,
            directory,
            placement: self
                .placement
                .unwrap_or_else(|| PlacementKind::default().build()),
            informer_interval: self.informer_interval,
            cache_sweep_interval: self.cache_sweep_interval,
            dispatch_timeout: self.dispatch_timeout,
        })
    }
}

/// Configuration for a [`ControlPlane`].
pub struct ControlPlaneConfig {
    store: Arc<dyn Store>,
    directory: Arc<dyn AgentDirectory>,
    placement: Arc<dyn PlacementPolicy>,
    informer_interval: Duration,
    cache_sweep_interval: Duration,
    dispatch_timeout: Duration,
}

impl std::fmt::Debug for ControlPlaneConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneConfig")
            .field("store", &self.store.store_type())
            .field("placement", &self.placement.name())
            .field("informer_interval", &self.informer_interval)
            .field("cache_sweep_interval", &self.cache_sweep_interval)
            .field("dispatch_timeout", &self.dispatch_timeout)
            .finish()
    }
}

impl ControlPlaneConfig {
    /// Start the runtime.
    ///
    /// Tears down workflows whose manifest disappeared while nothing was
    /// watching, then starts the workflow informer and its cache sweep.
    pub async fn start(self) -> Result<ControlPlane> {
        let manager = Arc::new(Manager::new());
        let source: Arc<dyn ChangeSource> = Arc::new(StoreChangeSource::new(self.store.clone()));
        let cache = Arc::new(
            Cache::new(SHARED_CACHE, source.clone()).with_sweep_interval(self.cache_sweep_interval),
        );

        let scheduler = Arc::new(
            Scheduler::new(self.directory, self.placement)
                .with_dispatch_timeout(self.dispatch_timeout),
        );
        let controller = Arc::new(WorkflowController::new(self.store.clone(), scheduler.clone()));

        match controller.reconcile_orphans().await {
            Ok(removed) if !removed.is_empty() => {
                info!(count = removed.len(), "Removed orphaned workflows")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Orphaned workflow cleanup failed"),
        }

        let informer = StoreController::new(
            WORKFLOW_INFORMER,
            WORKFLOW_PREFIX,
            controller.clone(),
            cache.clone(),
            source,
            manager.clone(),
        )
        .with_interval(self.informer_interval);
        informer.run().await;

        info!(
            store = self.store.store_type(),
            informer_interval_ms = self.informer_interval.as_millis() as u64,
            cache_sweep_interval_ms = self.cache_sweep_interval.as_millis() as u64,
            "ControlPlane started"
        );

        Ok(ControlPlane {
            store: self.store,
            manager,
            cache,
            scheduler,
            controller,
            informer,
        })
    }
}

/// A running control plane embedded in an application.
///
/// The runtime manages:
/// - the workflow informer polling `workflows/`
/// - the delete sweep of the shared cache
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControlPlane {
    store: Arc<dyn Store>,
    manager: Arc<Manager>,
    cache: Arc<Cache>,
    scheduler: Arc<Scheduler>,
    controller: Arc<WorkflowController>,
    informer: StoreController,
}

impl ControlPlane {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ControlPlaneBuilder {
        ControlPlaneBuilder::new()
    }

    /// Open the SQLite store named by `config` and start a runtime on it.
    pub async fn open(config: &Config, directory: Arc<dyn AgentDirectory>) -> Result<Self> {
        let store = SqliteStore::from_path(&config.database_path).await?;
        Self::builder()
            .config(config)
            .store(Arc::new(store))
            .directory(directory)
            .build()?
            .start()
            .await
    }

    /// Manifest and status access over the runtime's store.
    pub fn workflows(&self) -> WorkflowStore {
        WorkflowStore::new(self.store.clone())
    }

    /// The controller manager.
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// The cache shared by the runtime's informers.
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// The workflow reconciler.
    pub fn workflow_controller(&self) -> &Arc<WorkflowController> {
        &self.controller
    }

    /// Health of every known agent.
    pub async fn agent_health(&self) -> Vec<AgentHealth> {
        self.scheduler.agent_health().await
    }

    /// Statistics of every running controller.
    pub async fn controller_statuses(&self) -> Vec<ControllerStatus> {
        self.manager.statuses().await
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the workflow informer, then waits for every remaining
    /// controller to terminate.
    pub async fn shutdown(self) -> Result<()> {
        info!("ControlPlane shutting down...");

        if let Err(e) = self.informer.stop().await {
            error!(error = %e, "Workflow informer did not stop cleanly");
        }
        match self.manager.remove_all_and_wait().await {
            Ok(()) => {
                info!("ControlPlane shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "ControlPlane controllers failed during shutdown");
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("store", &self.store.store_type())
            .field("cache", &self.cache.name())
            .field("informer", &self.informer.name())
            .finish()
    }
}
