// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory agent directory.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use super::traits::*;

struct Entry {
    info: AgentInfo,
    connection: Arc<dyn AgentConnection>,
}

/// Directory of agents registered by the host process.
#[derive(Default)]
pub struct StaticAgentDirectory {
    agents: RwLock<BTreeMap<String, Entry>>,
}

impl StaticAgentDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an agent.
    pub async fn register(
        &self,
        name: impl Into<String>,
        labels: BTreeMap<String, String>,
        connection: Arc<dyn AgentConnection>,
    ) {
        let name = name.into();
        info!(agent = %name, labels = ?labels, "Agent registered");
        self.agents.write().await.insert(
            name.clone(),
            Entry {
                info: AgentInfo { name, labels },
                connection,
            },
        );
    }

    /// Remove an agent. Returns whether it was registered.
    pub async fn deregister(&self, name: &str) -> bool {
        let removed = self.agents.write().await.remove(name).is_some();
        if removed {
            info!(agent = %name, "Agent deregistered");
        }
        removed
    }
}

#[async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn connection(&self, name: &str) -> Result<Arc<dyn AgentConnection>> {
        self.agents
            .read()
            .await
            .get(name)
            .map(|entry| entry.connection.clone())
            .ok_or_else(|| AgentError::Unavailable(name.to_string()))
    }

    async fn agents(&self) -> Vec<AgentInfo> {
        self.agents
            .read()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;

    #[tokio::test]
    async fn test_register_lookup_deregister() {
        let directory = StaticAgentDirectory::new();
        let labels = BTreeMap::from([("zone".to_string(), "eu".to_string())]);
        directory
            .register("agent-b", BTreeMap::new(), Arc::new(MockAgent::new("agent-b")))
            .await;
        directory
            .register("agent-a", labels.clone(), Arc::new(MockAgent::new("agent-a")))
            .await;

        let agents = directory.agents().await;
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].name, "agent-a");
        assert!(agents[0].matches(&labels));
        assert!(!agents[1].matches(&labels));

        assert!(directory.connection("agent-a").await.is_ok());
        assert!(directory.deregister("agent-a").await);
        assert!(matches!(
            directory.connection("agent-a").await,
            Err(AgentError::Unavailable(_))
        ));
        assert!(!directory.deregister("agent-a").await);
    }
}
