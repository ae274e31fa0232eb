// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for convoy-control.

use std::path::PathBuf;
use std::time::Duration;

use crate::placement::PlacementKind;

/// Control plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file backing the store
    pub database_path: PathBuf,
    /// Delay between workflow informer passes
    pub informer_interval: Duration,
    /// Delay between cache delete sweeps
    pub cache_sweep_interval: Duration,
    /// Deadline of each agent call
    pub dispatch_timeout: Duration,
    /// Placement policy for new pipelines
    pub placement: PlacementKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".data/convoy.db"),
            informer_interval: Duration::from_secs(15),
            cache_sweep_interval: Duration::from_secs(30),
            dispatch_timeout: Duration::from_secs(30),
            placement: PlacementKind::RoundRobin,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_path = std::env::var("CONVOY_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let informer_interval =
            secs_var("CONVOY_INFORMER_INTERVAL_SECS", defaults.informer_interval)?;
        let cache_sweep_interval =
            secs_var("CONVOY_CACHE_SWEEP_INTERVAL_SECS", defaults.cache_sweep_interval)?;
        let dispatch_timeout = secs_var("CONVOY_DISPATCH_TIMEOUT_SECS", defaults.dispatch_timeout)?;
        if dispatch_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                var: "CONVOY_DISPATCH_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }

        let placement = match std::env::var("CONVOY_PLACEMENT") {
            Ok(value) => value.parse::<PlacementKind>().map_err(|reason| ConfigError::Invalid {
                var: "CONVOY_PLACEMENT",
                reason,
            })?,
            Err(_) => defaults.placement,
        };

        Ok(Self {
            database_path,
            informer_interval,
            cache_sweep_interval,
            dispatch_timeout,
            placement,
        })
    }
}

fn secs_var(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::Invalid {
                var,
                reason: format!("{:?} is not a number of seconds: {}", value, e),
            }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an unusable value.
    #[error("Invalid value for {var}: {reason}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
