// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent trait definitions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from agent calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// No connection to the named agent is available.
    #[error("Agent unavailable: {0}")]
    Unavailable(String),

    /// No agent is eligible to run the pipeline.
    #[error("No agent available for pipeline {0}")]
    NoCandidate(String),

    /// The call did not complete within the dispatch deadline.
    #[error("Agent {agent} did not answer within {timeout:?}")]
    Timeout {
        /// Agent name.
        agent: String,
        /// Deadline that expired.
        timeout: Duration,
    },

    /// The agent answered with an error.
    #[error("Agent {agent} rejected the request: {message}")]
    Rejected {
        /// Agent name.
        agent: String,
        /// Message from the agent.
        message: String,
    },

    /// JSON serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// One pipeline scheduling call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    /// Owning workflow.
    pub workflow: String,
    /// Pipeline name.
    pub pipeline: String,
    /// Pipeline spec as JSON.
    pub spec: Value,
}

/// Agent response to a scheduling call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Agent (executor) now responsible for the pipeline.
    pub executor: String,
    /// Status text.
    pub status: String,
    /// Last run of the pipeline on this agent.
    pub last_run: Option<DateTime<Utc>>,
}

/// Health state of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Accepting work.
    Serving,
    /// Up but not accepting work.
    NotServing,
    /// Health could not be determined.
    Unreachable,
}

/// Result of a status call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHealth {
    /// Agent name.
    pub agent: String,
    /// Health state.
    pub state: HealthState,
    /// Pipelines currently held by the agent, when known.
    pub pipelines: Option<usize>,
    /// Error or status detail.
    pub message: Option<String>,
}

impl AgentHealth {
    /// Health entry for an agent that could not be queried.
    pub fn unreachable(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            state: HealthState::Unreachable,
            pipelines: None,
            message: Some(message.into()),
        }
    }
}

/// Connection to one remote agent.
#[async_trait]
pub trait AgentConnection: Send + Sync {
    /// Place a new pipeline on the agent.
    async fn schedule_pipeline(&self, request: PipelineRequest) -> Result<PipelineReport>;

    /// Replace the spec of a pipeline the agent already runs.
    async fn update_pipeline(&self, request: PipelineRequest) -> Result<PipelineReport>;

    /// Remove a pipeline from the agent.
    async fn remove_pipeline(&self, request: PipelineRequest) -> Result<PipelineReport>;

    /// Query the agent's health.
    async fn status(&self) -> Result<AgentHealth>;
}

/// An agent known to a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Agent name.
    pub name: String,
    /// Labels used for placement.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl AgentInfo {
    /// Whether the agent carries every label of `selector`.
    pub fn matches(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(key, value)| self.labels.get(key) == Some(value))
    }
}

/// Lookup of agent connections by name.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Connection to the named agent.
    async fn connection(&self, name: &str) -> Result<Arc<dyn AgentConnection>>;

    /// Every known agent, ordered by name.
    async fn agents(&self) -> Vec<AgentInfo>;
}
