// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Name-keyed registry of controllers.
//!
//! The manager is an explicit value built once at process start and shared
//! as `Arc<Manager>` with every component that starts or inspects
//! controllers. Names are unique: registering an existing name swaps the
//! spec of the running loop instead of spawning a second one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::controller::{Controller, ControllerSpec, ControllerStatus};
use crate::error::{Error, Result};

/// Registry of running controllers.
#[derive(Debug, Default)]
pub struct Manager {
    controllers: RwLock<HashMap<String, Arc<Controller>>>,
}

impl Manager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the named controller, or swap the spec of an existing one and
    /// wake it.
    ///
    /// Never waits for a pass to run. Returns `true` when a new controller
    /// was spawned.
    pub async fn update_controller(
        &self,
        name: impl Into<String>,
        kind: impl Into<String>,
        spec: ControllerSpec,
    ) -> bool {
        let name = name.into();
        let mut controllers = self.controllers.write().await;

        if let Some(existing) = controllers.get(&name) {
            debug!(controller = %name, kind = %existing.kind(), "Updating controller spec");
            existing.update(spec);
            return false;
        }

        let kind = kind.into();
        info!(
            controller = %name,
            kind = %kind,
            run_interval_ms = spec.run_interval.as_millis() as u64,
            "Starting controller"
        );
        let controller = Controller::spawn(name.clone(), kind, spec);
        controllers.insert(name, controller);
        true
    }

    /// Signal the named controller to stop and return immediately.
    ///
    /// The loop may still be finishing its current pass when this returns.
    pub async fn remove_controller(&self, name: &str) -> Result<()> {
        self.take(name).await?.signal_stop();
        info!(controller = %name, "Controller removal requested");
        Ok(())
    }

    /// Stop the named controller and wait until it has terminated.
    pub async fn remove_controller_and_wait(&self, name: &str) -> Result<()> {
        let controller = self.take(name).await?;
        controller.signal_stop();
        controller.wait_terminated().await?;
        info!(controller = %name, "Controller removed");
        Ok(())
    }

    /// Signal every controller to stop without waiting.
    pub async fn remove_all(&self) {
        let drained: Vec<_> = self.controllers.write().await.drain().collect();
        for (_, controller) in drained {
            controller.signal_stop();
        }
    }

    /// Stop every controller and wait for all of them to terminate.
    ///
    /// Used as the shutdown barrier. All controllers are signalled before the
    /// first wait so they wind down concurrently.
    pub async fn remove_all_and_wait(&self) -> Result<()> {
        let drained: Vec<_> = self.controllers.write().await.drain().collect();
        if drained.is_empty() {
            return Ok(());
        }

        info!(count = drained.len(), "Stopping all controllers");
        for (_, controller) in &drained {
            controller.signal_stop();
        }

        let mut first_error = None;
        for (name, controller) in drained {
            if let Err(e) = controller.wait_terminated().await {
                error!(controller = %name, error = %e, "Controller did not terminate cleanly");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Snapshot of one controller's statistics.
    pub async fn status(&self, name: &str) -> Option<ControllerStatus> {
        let controller = self.controllers.read().await.get(name).cloned()?;
        Some(controller.status().await)
    }

    /// Snapshots of every controller, sorted by name.
    pub async fn statuses(&self) -> Vec<ControllerStatus> {
        let controllers: Vec<_> = self.controllers.read().await.values().cloned().collect();

        let mut statuses = Vec::with_capacity(controllers.len());
        for controller in controllers {
            statuses.push(controller.status().await);
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Names of all registered controllers, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.controllers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a controller is registered under `name`.
    pub async fn contains(&self, name: &str) -> bool {
        self.controllers.read().await.contains_key(name)
    }

    /// Number of registered controllers.
    pub async fn len(&self) -> usize {
        self.controllers.read().await.len()
    }

    /// Whether no controllers are registered.
    pub async fn is_empty(&self) -> bool {
        self.controllers.read().await.is_empty()
    }

    async fn take(&self, name: &str) -> Result<Arc<Controller>> {
        self.controllers
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::ControllerNotFound(name.to_string()))
    }
}
