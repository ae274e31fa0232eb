// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Desired vs last-applied pipeline diff.

use std::fmt;

use serde::Serialize;

use crate::workflow::WorkflowSpec;

/// What to do with one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineAction {
    /// Place the pipeline on an agent.
    Schedule,
    /// Replace the pipeline's spec on its agent.
    Update,
    /// Remove the pipeline from its agent.
    Remove,
}

impl fmt::Display for PipelineAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineAction::Schedule => write!(f, "schedule"),
            PipelineAction::Update => write!(f, "update"),
            PipelineAction::Remove => write!(f, "remove"),
        }
    }
}

/// An action bound to a pipeline name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedAction {
    /// Pipeline name.
    pub pipeline: String,
    /// Action to dispatch.
    pub action: PipelineAction,
}

impl PlannedAction {
    /// Bind `action` to `pipeline`.
    pub fn new(pipeline: &str, action: PipelineAction) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            action,
        }
    }
}

/// Actions turning `last_applied` into `desired`, ordered by pipeline name.
///
/// Both specs must have their triggers resolved. Unchanged pipelines
/// produce no action.
pub fn plan(desired: &WorkflowSpec, last_applied: &WorkflowSpec) -> Vec<PlannedAction> {
    let mut actions = Vec::new();

    for (name, spec) in &desired.pipelines {
        match last_applied.pipelines.get(name) {
            None => actions.push(PlannedAction::new(name, PipelineAction::Schedule)),
            Some(previous) if spec.differs_from(previous) => {
                actions.push(PlannedAction::new(name, PipelineAction::Update))
            }
            Some(_) => {}
        }
    }

    for name in last_applied.pipelines.keys() {
        if !desired.pipelines.contains_key(name) {
            actions.push(PlannedAction::new(name, PipelineAction::Remove));
        }
    }

    actions.sort_by(|a, b| a.pipeline.cmp(&b.pipeline));
    actions
}
