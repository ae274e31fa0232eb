// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client-facing access to workflow manifests and status documents.

use std::sync::Arc;

use convoy_core::Store;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::status::{STATUS_PREFIX, WorkflowStatus, status_key};
use crate::workflow::{WORKFLOW_PREFIX, WorkflowSpec, workflow_key, workflow_name_from_key};

/// Reads and writes workflow manifests and reads their status.
///
/// Writes only touch `workflows/<name>`; convergence happens when the
/// informer notices the change.
#[derive(Clone)]
pub struct WorkflowStore {
    store: Arc<dyn Store>,
}

impl WorkflowStore {
    /// Wrap a shared store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Validate and store a manifest, returning its new version.
    pub async fn submit_workflow(&self, spec: &WorkflowSpec) -> Result<u64> {
        spec.validate()?;

        // Downstream lists are derived on the reading side.
        let mut manifest = spec.clone();
        for pipeline in manifest.pipelines.values_mut() {
            pipeline.downstream.clear();
        }

        let data = serde_json::to_vec(&manifest)?;
        let version = self.store.set(&workflow_key(&spec.name), &data).await?;
        info!(
            workflow = %spec.name,
            version,
            pipelines = spec.pipelines.len(),
            "Workflow submitted"
        );
        Ok(version)
    }

    /// Delete a manifest. Pipelines are torn down asynchronously.
    pub async fn delete_workflow(&self, name: &str) -> Result<()> {
        match self.store.delete(&workflow_key(name)).await {
            Ok(()) => {
                info!(workflow = %name, "Workflow deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Err(Error::WorkflowNotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a stored manifest.
    pub async fn get_workflow(&self, name: &str) -> Result<WorkflowSpec> {
        match self.store.get(&workflow_key(name)).await {
            Ok(kv) => Ok(WorkflowSpec::from_manifest(name, &kv.data)?),
            Err(e) if e.is_not_found() => Err(Error::WorkflowNotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all live manifests, sorted.
    pub async fn list_workflows(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .list_prefix(WORKFLOW_PREFIX)
            .await?
            .into_iter()
            .filter(|kv| !kv.deleted_or_expired)
            .filter_map(|kv| workflow_name_from_key(&kv.key).map(str::to_string))
            .collect())
    }

    /// Status of one workflow, if it has converged at least once.
    pub async fn workflow_status(&self, name: &str) -> Result<Option<WorkflowStatus>> {
        match self.store.get(&status_key(name)).await {
            Ok(kv) => Ok(Some(WorkflowStatus::decode(&kv.data)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every status document, ordered by workflow name.
    ///
    /// Documents that fail to decode are logged and left out.
    pub async fn list_statuses(&self) -> Result<Vec<WorkflowStatus>> {
        let mut statuses = Vec::new();
        for kv in self.store.list_prefix(STATUS_PREFIX).await? {
            if kv.deleted_or_expired {
                continue;
            }
            match WorkflowStatus::decode(&kv.data) {
                Ok(status) => statuses.push(status),
                Err(e) => warn!(key = %kv.key, error = %e, "Skipping undecodable workflow status"),
            }
        }
        Ok(statuses)
    }
}

impl std::fmt::Debug for WorkflowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStore")
            .field("store", &self.store.store_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{PipelineSpec, TaskSpec, Trigger, ValidationError};
    use convoy_core::store::MemoryStore;

    fn spec() -> WorkflowSpec {
        let mut spec = WorkflowSpec::empty("wf1");
        spec.pipelines.insert(
            "build".into(),
            PipelineSpec {
                triggers: vec![Trigger::Manual],
                tasks: vec![TaskSpec {
                    name: "compile".into(),
                    image: "rust:1".into(),
                    commands: vec!["cargo build".into()],
                    env: Default::default(),
                }],
                ..PipelineSpec::default()
            },
        );
        spec
    }

    #[tokio::test]
    async fn test_submit_and_read_back() {
        let workflows = WorkflowStore::new(Arc::new(MemoryStore::new()));
        workflows.submit_workflow(&spec()).await.unwrap();

        assert_eq!(workflows.get_workflow("wf1").await.unwrap(), spec());
        assert_eq!(workflows.list_workflows().await.unwrap(), vec!["wf1".to_string()]);
        assert!(workflows.workflow_status("wf1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_spec() {
        let workflows = WorkflowStore::new(Arc::new(MemoryStore::new()));
        let mut bad = spec();
        bad.pipelines
            .get_mut("build")
            .unwrap()
            .triggers
            .push(Trigger::Pipeline { name: "build".into() });

        let err = workflows.submit_workflow(&bad).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::SelfTrigger(_))));
        assert!(workflows.list_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_statuses_skips_undecodable_documents() {
        let store = Arc::new(MemoryStore::new());
        let workflows = WorkflowStore::new(store.clone());

        let good = WorkflowStatus::new(spec(), Default::default());
        store
            .set(&status_key("a-good"), &good.encode().unwrap())
            .await
            .unwrap();
        store.set(&status_key("b-bad"), b"not json").await.unwrap();

        let statuses = workflows.list_statuses().await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].name(), "wf1");
    }

    #[tokio::test]
    async fn test_delete_unknown_workflow() {
        let workflows = WorkflowStore::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            workflows.delete_workflow("nope").await,
            Err(Error::WorkflowNotFound(_))
        ));

        workflows.submit_workflow(&spec()).await.unwrap();
        workflows.delete_workflow("wf1").await.unwrap();
        assert!(workflows.list_workflows().await.unwrap().is_empty());
        assert!(matches!(
            workflows.get_workflow("wf1").await,
            Err(Error::WorkflowNotFound(_))
        ));
    }
}
