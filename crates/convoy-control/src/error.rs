// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for convoy-control.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::diff::PipelineAction;

/// One pipeline action that failed during a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchFailure {
    /// Pipeline name.
    pub pipeline: String,
    /// Action that failed.
    pub action: PipelineAction,
    /// Error message.
    pub error: String,
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.action, self.pipeline, self.error)
    }
}

fn join_failures(failures: &[DispatchFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Control plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Reconciliation runtime failed.
    #[error("Runtime error: {0}")]
    Core(#[from] convoy_core::Error),

    /// Storage operation failed.
    #[error("Store error: {0}")]
    Store(#[from] convoy_core::StoreError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Manifest validation failed.
    #[error("Invalid workflow: {0}")]
    Validation(#[from] crate::workflow::ValidationError),

    /// Agent call failed.
    #[error("Agent error: {0}")]
    Agent(#[from] crate::agent::AgentError),

    /// Some pipeline actions of a workflow failed.
    #[error("Workflow {workflow}: {} pipeline action(s) failed: {}", .failures.len(), join_failures(.failures))]
    Dispatch {
        /// Workflow name.
        workflow: String,
        /// Failed actions.
        failures: Vec<DispatchFailure>,
    },

    /// Workflow was not found.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the control plane error.
pub type Result<T> = std::result::Result<T, Error>;
