// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Convoy Control - Workflow Control Plane
//!
//! This crate converges declared workflows onto a fleet of agents. Clients
//! write workflow manifests under `workflows/<name>`; a polling informer
//! notices the change and the [`WorkflowController`] diffs the manifest
//! against the last-applied spec, dispatching one Schedule, Update or Remove
//! per changed pipeline.
//!
//! # Architecture
//!
//! ```text
//!   client ──► WorkflowStore ──► workflows/<name>
//!                                      │ polled by
//!                                      ▼
//!                       StoreController (convoy-core)
//!                                      │ on_add / on_update / on_delete
//!                                      ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       WorkflowController                             │
//! │  validate → load status → plan(desired, last-applied) → dispatch    │
//! └─────────────────────────────────────────────────────────────────────┘
//!            │                                          │
//!            ▼                                          ▼
//! ┌───────────────────────────┐              ┌───────────────────────────┐
//! │        Scheduler          │              │  status/workflows/<name>  │
//! │  placement + deadline     │              │  last-applied spec and    │
//! │  per agent call           │              │  per-pipeline status      │
//! └───────────────────────────┘              └───────────────────────────┘
//!            │
//!            ▼
//!   AgentDirectory ──► AgentConnection (one per agent)
//! ```
//!
//! # Convergence Rules
//!
//! | Desired | Last applied | Action |
//! |---------|--------------|--------|
//! | present | absent | Schedule |
//! | present | present, different | Update |
//! | absent | present | Remove |
//! | present | present, equal | none |
//!
//! Only actions that succeed are folded into the persisted status, so a
//! failed action is planned again on the next informer pass.
//!
//! # Modules
//!
//! - [`workflow`]: Manifest model and validation
//! - [`diff`]: Pipeline action planning
//! - [`status`]: Persisted convergence state
//! - [`agent`]: Agent contract, directory and in-memory agent
//! - [`placement`]: Placement policies
//! - [`scheduler`]: Agent dispatch with deadlines
//! - [`workflow_controller`]: The informer handler
//! - [`repository`]: Client-facing manifest and status access
//! - [`runtime`]: Embeddable runtime
//! - [`config`]: Environment configuration
//! - [`error`]: Error types

#![deny(missing_docs)]

/// Agent contract, directory and in-memory agent.
pub mod agent;

/// Environment configuration.
pub mod config;

/// Pipeline action planning.
pub mod diff;

/// Error types for the control plane.
pub mod error;

/// Placement policies.
pub mod placement;

/// Client-facing manifest and status access.
pub mod repository;

/// Embeddable control plane runtime.
pub mod runtime;

/// Agent dispatch with deadlines.
pub mod scheduler;

/// Persisted convergence state.
pub mod status;

/// Workflow manifest model and validation.
pub mod workflow;

/// Informer handler converging workflows.
pub mod workflow_controller;

pub use config::Config;
pub use diff::{PipelineAction, PlannedAction, plan};
pub use error::{DispatchFailure, Error, Result};
pub use repository::WorkflowStore;
pub use runtime::{ControlPlane, init_tracing};
pub use scheduler::Scheduler;
pub use status::{PipelineStatus, WorkflowStatus};
pub use workflow::{PipelineSpec, TaskSpec, Trigger, ValidationError, WorkflowSpec};
pub use workflow_controller::{ReconcileReport, WorkflowController};
