// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for convoy-core.

use thiserror::Error;

/// Reconciliation runtime errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Storage backend operation failed.
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// No controller is registered under the given name.
    #[error("Controller not found: {0}")]
    ControllerNotFound(String),

    /// The controller task panicked or was aborted before terminating.
    #[error("Controller '{name}' task failed: {details}")]
    ControllerTask {
        /// Controller name.
        name: String,
        /// Join error details.
        details: String,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the core Error.
pub type Result<T> = std::result::Result<T, Error>;
