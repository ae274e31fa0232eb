// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent module - the remote side of pipeline scheduling.
//!
//! Transport is out of scope: an [`AgentConnection`] is whatever can carry
//! Schedule/Update/Remove/Status calls to one agent.

mod directory;
pub mod mock;
mod traits;

pub use directory::StaticAgentDirectory;
pub use mock::MockAgent;
pub use traits::*;
