// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow reconciliation.
//!
//! The [`WorkflowController`] is the informer handler for workflow
//! manifests. For every new or changed manifest it diffs the desired
//! pipelines against the last-applied spec embedded in the workflow's
//! status document, dispatches one action per changed pipeline, and writes
//! back a status that records only what actually converged. Schedules
//! whose outcome is unknown are remembered with their agent and retried
//! or removed there.
//!
//! ```text
//!   manifest ──► validate ──► load status ──► plan(desired, last-applied)
//!                                                   │
//!                     ┌─────────────────────────────┘
//!                     ▼
//!         Schedule / Update / Remove via Scheduler (per pipeline)
//!                     │
//!                     ▼
//!         persist merged status ──► log aggregate failures
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use convoy_core::{KvSnapshot, ResourceHandler, Store};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::diff::{PipelineAction, PlannedAction, plan};
use crate::error::{DispatchFailure, Error, Result};
use crate::scheduler::Scheduler;
use crate::status::{
    PipelineStatus, STATUS_PREFIX, UnconfirmedPipeline, WorkflowStatus, status_key,
};
use crate::workflow::{ValidationError, WorkflowSpec, workflow_key, workflow_name_from_key};

/// Outcome of reconciling one workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Workflow name.
    pub workflow: String,
    /// Actions that succeeded.
    pub applied: Vec<PlannedAction>,
    /// Actions that failed.
    pub failures: Vec<DispatchFailure>,
    /// Whether the status document was written (or deleted).
    pub status_written: bool,
}

impl ReconcileReport {
    fn new(workflow: &str) -> Self {
        Self {
            workflow: workflow.to_string(),
            ..Self::default()
        }
    }

    /// Number of actions attempted.
    pub fn attempted(&self) -> usize {
        self.applied.len() + self.failures.len()
    }

    /// Whether every attempted action succeeded.
    pub fn is_converged(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn failed actions into [`Error::Dispatch`].
    pub fn into_result(self) -> Result<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(Error::Dispatch {
                workflow: self.workflow,
                failures: self.failures,
            })
        }
    }
}

/// Working copy of a workflow's status document during one pass.
struct AppliedState {
    spec: WorkflowSpec,
    pipelines: BTreeMap<String, PipelineStatus>,
    unconfirmed: BTreeMap<String, UnconfirmedPipeline>,
}

impl AppliedState {
    fn empty(name: &str) -> Self {
        Self {
            spec: WorkflowSpec::empty(name),
            pipelines: BTreeMap::new(),
            unconfirmed: BTreeMap::new(),
        }
    }

    fn from_status(status: WorkflowStatus) -> Self {
        let mut spec = status.spec;
        spec.resolve_triggers();
        Self {
            spec,
            pipelines: status.pipelines,
            unconfirmed: status.unconfirmed,
        }
    }

    fn into_status(self) -> WorkflowStatus {
        WorkflowStatus::new(self.spec, self.pipelines).with_unconfirmed(self.unconfirmed)
    }
}

/// Informer handler converging workflows onto agents.
pub struct WorkflowController {
    store: Arc<dyn Store>,
    scheduler: Arc<Scheduler>,
}

impl WorkflowController {
    /// Create a controller persisting status in `store`.
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<Scheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Load a workflow's status document.
    pub async fn load_status(&self, name: &str) -> Result<Option<WorkflowStatus>> {
        match self.store.get(&status_key(name)).await {
            Ok(kv) => Ok(Some(WorkflowStatus::decode(&kv.data)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Converge the workflow described by the manifest stored at `key`.
    ///
    /// Returns `Err` for invalid manifests and failed status writes. Failed
    /// pipeline actions are listed in the report; the status is written
    /// regardless.
    pub async fn reconcile_manifest(&self, key: &str, data: &[u8]) -> Result<ReconcileReport> {
        let name = workflow_name_from_key(key)
            .ok_or_else(|| ValidationError::InvalidName(key.to_string()))?;
        let desired = WorkflowSpec::from_manifest(name, data)?;

        let previous = self.load_status(name).await?;
        let existed = previous.is_some();
        let mut state = match previous {
            Some(status) => AppliedState::from_status(status),
            None => AppliedState::empty(name),
        };

        let mut actions = plan(&desired, &state.spec);
        // Unconfirmed pipelines dropped from the manifest are removed from
        // the agent that may hold them. Kept ones are rescheduled by plan.
        let stale: Vec<_> = state
            .unconfirmed
            .keys()
            .filter(|p| !desired.pipelines.contains_key(*p))
            .map(|p| PlannedAction::new(p, PipelineAction::Remove))
            .collect();
        if !stale.is_empty() {
            actions.extend(stale);
            actions.sort_by(|a, b| a.pipeline.cmp(&b.pipeline));
        }
        debug!(
            workflow = %name,
            digest = %desired.digest(),
            actions = actions.len(),
            "Planned workflow actions"
        );

        let mut report = ReconcileReport::new(name);
        for planned in actions {
            match self
                .apply(name, &planned, &desired, &mut state)
                .await
            {
                Ok(()) => report.applied.push(planned),
                Err(e) => {
                    warn!(
                        workflow = %name,
                        pipeline = %planned.pipeline,
                        action = %planned.action,
                        error = %e,
                        "Pipeline action failed"
                    );
                    report.failures.push(DispatchFailure {
                        pipeline: planned.pipeline,
                        action: planned.action,
                        error: e.to_string(),
                    });
                }
            }
        }

        let description_changed = state.spec.description != desired.description;
        if existed && report.attempted() == 0 && !description_changed {
            debug!(workflow = %name, "Workflow already converged");
            return Ok(report);
        }

        state.spec.description = desired.description.clone();
        self.save_status(state.into_status()).await?;
        report.status_written = true;

        if report.is_converged() {
            info!(workflow = %name, actions = report.applied.len(), "Workflow converged");
        } else {
            let err = Error::Dispatch {
                workflow: name.to_string(),
                failures: report.failures.clone(),
            };
            warn!(
                workflow = %name,
                succeeded = report.applied.len(),
                failed = report.failures.len(),
                error = %err,
                "Workflow partially converged"
            );
        }
        Ok(report)
    }

    /// Remove every pipeline of a deleted workflow.
    ///
    /// The status document is deleted once all removals succeed; otherwise
    /// the pipelines still placed are persisted and listed as failures.
    pub async fn reconcile_removal(&self, key: &str) -> Result<ReconcileReport> {
        let name = workflow_name_from_key(key)
            .ok_or_else(|| ValidationError::InvalidName(key.to_string()))?;
        self.remove_workflow(name).await
    }

    /// Tear down workflows whose status outlived their manifest.
    ///
    /// Covers manifests deleted while no informer was watching. Returns the
    /// names of the workflows that were fully removed.
    pub async fn reconcile_orphans(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for kv in self.store.list_prefix(STATUS_PREFIX).await? {
            if kv.deleted_or_expired {
                continue;
            }
            let Some(name) = kv.key.strip_prefix(STATUS_PREFIX) else {
                continue;
            };
            if self.store.exists(&workflow_key(name)).await? {
                continue;
            }

            info!(workflow = %name, "Removing orphaned workflow status");
            match self.remove_workflow(name).await?.into_result() {
                Ok(_) => removed.push(name.to_string()),
                Err(e) => warn!(workflow = %name, error = %e, "Orphaned workflow not fully removed"),
            }
        }
        Ok(removed)
    }

    async fn remove_workflow(&self, name: &str) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::new(name);
        let Some(status) = self.load_status(name).await? else {
            debug!(workflow = %name, "No status for deleted workflow");
            return Ok(report);
        };

        let mut state = AppliedState::from_status(status);
        let desired = WorkflowSpec::empty(name);
        let pipelines: Vec<_> = state
            .spec
            .pipelines
            .keys()
            .chain(state.unconfirmed.keys())
            .cloned()
            .collect();
        for pipeline in pipelines {
            let planned = PlannedAction::new(&pipeline, PipelineAction::Remove);
            match self
                .apply(name, &planned, &desired, &mut state)
                .await
            {
                Ok(()) => report.applied.push(planned),
                Err(e) => {
                    warn!(workflow = %name, pipeline = %pipeline, error = %e, "Pipeline removal failed");
                    report.failures.push(DispatchFailure {
                        pipeline,
                        action: PipelineAction::Remove,
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.is_converged() {
            match self.store.delete(&status_key(name)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!(workflow = %name, error = %e, "Failed to delete workflow status");
                    return Err(e.into());
                }
            }
            info!(workflow = %name, pipelines = report.applied.len(), "Workflow removed");
        } else {
            self.save_status(state.into_status()).await?;
        }
        report.status_written = true;
        Ok(report)
    }

    /// Dispatch one action, folding the outcome into the last-applied spec
    /// and status map only on success.
    ///
    /// A failed schedule that left an executor behind is kept as
    /// unconfirmed so the next pass goes back to the same agent.
    async fn apply(
        &self,
        workflow: &str,
        planned: &PlannedAction,
        desired: &WorkflowSpec,
        state: &mut AppliedState,
    ) -> Result<()> {
        let name = planned.pipeline.as_str();
        let unconfirmed = state.unconfirmed.get(name);
        let spec = match planned.action {
            PipelineAction::Schedule | PipelineAction::Update => desired.pipelines.get(name),
            PipelineAction::Remove => state
                .spec
                .pipelines
                .get(name)
                .or(unconfirmed.map(|p| &p.spec)),
        }
        .cloned()
        .ok_or_else(|| Error::Other(format!("pipeline {} missing from plan input", name)))?;

        let mut status = match planned.action {
            PipelineAction::Schedule => unconfirmed.map(|p| p.status.clone()).unwrap_or_default(),
            PipelineAction::Update => state.pipelines.get(name).cloned().unwrap_or_default(),
            PipelineAction::Remove => state
                .pipelines
                .get(name)
                .or(unconfirmed.map(|p| &p.status))
                .cloned()
                .unwrap_or_default(),
        };

        let outcome = self
            .scheduler
            .dispatch(planned.action, workflow, name, &spec, &mut status)
            .await;
        if let Err(e) = outcome {
            if planned.action == PipelineAction::Schedule && status.executor.is_some() {
                state
                    .unconfirmed
                    .insert(name.to_string(), UnconfirmedPipeline { spec, status });
            }
            return Err(e.into());
        }

        state.unconfirmed.remove(name);
        match planned.action {
            PipelineAction::Schedule | PipelineAction::Update => {
                state.spec.pipelines.insert(name.to_string(), spec);
                state.pipelines.insert(name.to_string(), status);
            }
            PipelineAction::Remove => {
                state.spec.pipelines.remove(name);
                state.pipelines.remove(name);
            }
        }
        Ok(())
    }

    async fn save_status(&self, mut status: WorkflowStatus) -> Result<()> {
        status.updated_at = Some(Utc::now());
        let data = status.encode()?;
        if let Err(e) = self.store.set(&status_key(status.name()), &data).await {
            error!(workflow = %status.name(), error = %e, "Failed to persist workflow status");
            return Err(e.into());
        }
        debug!(
            workflow = %status.name(),
            pipelines = status.pipelines.len(),
            "Persisted workflow status"
        );
        Ok(())
    }

    async fn handle_manifest(&self, kv: &KvSnapshot) -> anyhow::Result<()> {
        match self.reconcile_manifest(&kv.key, &kv.data).await {
            Ok(report) => {
                report.into_result()?;
                Ok(())
            }
            Err(Error::Validation(e)) => {
                // Retrying cannot help until the manifest changes.
                error!(key = %kv.key, version = kv.version, error = %e, "Rejected workflow manifest");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for WorkflowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowController")
            .field("store", &self.store.store_type())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

#[async_trait]
impl ResourceHandler for WorkflowController {
    async fn on_add(&self, kv: &KvSnapshot) -> anyhow::Result<()> {
        debug!(key = %kv.key, version = kv.version, "Workflow added");
        self.handle_manifest(kv).await
    }

    async fn on_update(&self, kv: &KvSnapshot, previous_version: u64) -> anyhow::Result<()> {
        debug!(
            key = %kv.key,
            version = kv.version,
            previous_version,
            "Workflow updated"
        );
        self.handle_manifest(kv).await
    }

    async fn on_delete(&self, key: &str) -> anyhow::Result<()> {
        debug!(key = %key, "Workflow deleted");
        self.reconcile_removal(key).await?.into_result()?;
        Ok(())
    }
}
