// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Convoy Core - Reconciliation Runtime
//!
//! This crate provides the machinery the convoy control plane uses to keep
//! actual state converged with desired state on top of a key/value store that
//! has no watch primitive. Change detection is emulated by polling.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Manager                                     │
//! │              (name-keyed registry of running Controllers)               │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            │ drives                                   │ drives
//!            ▼                                          ▼
//! ┌───────────────────────────┐              ┌───────────────────────────┐
//! │  StoreController (pass)   │              │   Cache sweep Controller  │
//! │  prefix scan → diff →     │              │   check cached keys →     │
//! │  add / update / delete    │              │   silent delete detection │
//! └───────────────────────────┘              └───────────────────────────┘
//!            │                                          │
//!            └──────────────┬───────────────────────────┘
//!                           ▼
//!              ┌───────────────────────────┐
//!              │          Cache            │
//!              │   key → last seen version │
//!              └───────────────────────────┘
//!                           │
//!                           ▼
//!              ┌───────────────────────────┐
//!              │  ChangeSource / Store     │
//!              │  (memory, SQLite)         │
//!              └───────────────────────────┘
//! ```
//!
//! # Controller State Machine
//!
//! ```text
//!            update                      interval == 0 and success
//!   ┌──────────────────────┐         ┌──────────────────────────────┐
//!   │                      ▼         │                              ▼
//! ┌──────┐             ┌─────────┐───┘                          ┌──────┐
//! │ IDLE │◄────────────│ RUNNING │◄─────── timeout / update ────│ WAIT │
//! └──────┘             └─────────┘─────────────────────────────►└──────┘
//!     │                     │          interval or backoff          │
//!     │ stop                │ stop                                  │ stop
//!     ▼                     ▼                                       ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │ STOPPED: context cancelled, stop function run once, terminated set │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Delete Detection
//!
//! | Path | Trigger | Latency |
//! |------|---------|---------|
//! | Tombstone | scan returns key with `deleted_or_expired` | one informer pass |
//! | Silent | key missing from storage entirely | one or two sweep intervals |
//!
//! # Modules
//!
//! - [`controller`]: Reconciler trait and the per-controller run loop
//! - [`manager`]: Controller registry
//! - [`store`]: Storage contract and backends
//! - [`cache`]: Shared version cache with background delete sweep
//! - [`informer`]: Prefix-watching StoreController
//! - [`error`]: Error types

#![deny(missing_docs)]

/// Shared version cache with background delete sweep.
pub mod cache;

/// Reconciler trait, controller spec and run loop.
pub mod controller;

/// Error types for the reconciliation runtime.
pub mod error;

/// Prefix-watching store controller.
pub mod informer;

/// Name-keyed registry of controllers.
pub mod manager;

/// Key/value storage contract and backends.
pub mod store;

pub use cache::Cache;
pub use controller::{ControllerSpec, ControllerStatus, Reconciler, reconcile_fn};
pub use error::{Error, Result};
pub use informer::{ResourceHandler, StoreController};
pub use manager::Manager;
pub use store::{ChangeSource, KvSnapshot, Store, StoreError};
