// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for convoy-control integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use convoy_control::agent::{MockAgent, StaticAgentDirectory};
use convoy_control::placement::{PlacementPolicy, RoundRobinPlacement};
use convoy_control::{Scheduler, WorkflowController, WorkflowSpec};
use convoy_core::store::MemoryStore;
use serde_json::{Value, json};

/// Workflow controller over a memory store and a set of mock agents.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub directory: Arc<StaticAgentDirectory>,
    pub agents: Vec<Arc<MockAgent>>,
    pub controller: WorkflowController,
}

impl Fixture {
    /// One unlabeled agent named `agent-a`, round-robin placement.
    pub async fn new() -> Self {
        Self::with_agents(
            vec![("agent-a", BTreeMap::new())],
            Arc::new(RoundRobinPlacement::new()),
        )
        .await
    }

    pub async fn with_agents(
        agents: Vec<(&str, BTreeMap<String, String>)>,
        placement: Arc<dyn PlacementPolicy>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(StaticAgentDirectory::new());
        let mut mocks = Vec::new();
        for (name, labels) in agents {
            let agent = Arc::new(MockAgent::new(name));
            directory
                .register(name, labels, agent.clone())
                .await;
            mocks.push(agent);
        }

        let scheduler = Arc::new(
            Scheduler::new(directory.clone(), placement)
                .with_dispatch_timeout(Duration::from_millis(200)),
        );
        let controller = WorkflowController::new(store.clone(), scheduler);
        Self {
            store,
            directory,
            agents: mocks,
            controller,
        }
    }

    pub fn agent(&self) -> &Arc<MockAgent> {
        &self.agents[0]
    }
}

pub fn labels_of(labels: &[(&str, &str)]) -> BTreeMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Pipeline with one task running `image`, started manually.
pub fn pipeline(image: &str) -> Value {
    json!({
        "triggers": [{"type": "manual"}],
        "tasks": [{"name": "run", "image": image, "commands": ["make"]}]
    })
}

/// Manifest bytes for workflow `name`.
pub fn manifest(name: &str, pipelines: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({"name": name, "pipelines": pipelines})).unwrap()
}

/// Typed workflow spec for `name`.
pub fn workflow(name: &str, pipelines: Value) -> WorkflowSpec {
    serde_json::from_value(json!({"name": name, "pipelines": pipelines})).unwrap()
}

/// Poll `check` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
