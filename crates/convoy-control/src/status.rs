// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted convergence state of a workflow.
//!
//! One document per workflow. The embedded spec is the last-applied
//! baseline for the next diff; the pipeline map is what status queries
//! return. Only pipelines whose dispatch succeeded appear in either.
//! Pipelines whose schedule call timed out are kept apart as unconfirmed,
//! together with the agent that was asked.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::{PipelineSpec, WorkflowSpec};

/// Key prefix of workflow status documents.
pub const STATUS_PREFIX: &str = "status/workflows/";

/// Store key of a workflow's status document.
pub fn status_key(name: &str) -> String {
    format!("{}{}", STATUS_PREFIX, name)
}

/// Status recorded for a pipeline whose schedule call timed out.
pub const UNKNOWN_STATUS: &str = "unknown";

/// Status of one pipeline as last reported by its agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    /// Agent running the pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    /// Free-form status text from the agent.
    #[serde(default)]
    pub status: String,
    /// Last run reported by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

/// A pipeline sent to an agent whose answer never arrived.
///
/// The agent may hold it, so later schedules and removals go to the
/// recorded executor instead of a fresh placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnconfirmedPipeline {
    /// Spec that was sent.
    pub spec: PipelineSpec,
    /// Status carrying the attempted executor.
    pub status: PipelineStatus,
}

/// Persisted status document of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    /// Last-applied spec: only the pipelines that converged.
    pub spec: WorkflowSpec,
    /// Per-pipeline status.
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineStatus>,
    /// Pipelines outside the last-applied spec that an agent may still hold.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unconfirmed: BTreeMap<String, UnconfirmedPipeline>,
    /// When the document was last written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkflowStatus {
    /// Build a document, dropping statuses of pipelines not in `spec`.
    pub fn new(spec: WorkflowSpec, mut pipelines: BTreeMap<String, PipelineStatus>) -> Self {
        pipelines.retain(|name, _| spec.pipelines.contains_key(name));
        Self {
            spec,
            pipelines,
            unconfirmed: BTreeMap::new(),
            updated_at: None,
        }
    }

    /// Attach unconfirmed pipelines. Entries already in the spec or without
    /// an executor are dropped.
    pub fn with_unconfirmed(
        mut self,
        mut unconfirmed: BTreeMap<String, UnconfirmedPipeline>,
    ) -> Self {
        unconfirmed.retain(|name, p| {
            !self.spec.pipelines.contains_key(name) && p.status.executor.is_some()
        });
        self.unconfirmed = unconfirmed;
        self
    }

    /// Workflow name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Decode a stored document.
    pub fn decode(data: &[u8]) -> serde_json::Result<Self> {
        let status: WorkflowStatus = serde_json::from_slice(data)?;
        let unconfirmed = status.unconfirmed;
        let updated_at = status.updated_at;
        let mut status =
            WorkflowStatus::new(status.spec, status.pipelines).with_unconfirmed(unconfirmed);
        status.updated_at = updated_at;
        Ok(status)
    }

    /// Encode for storage.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
