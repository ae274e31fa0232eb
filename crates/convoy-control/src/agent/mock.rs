// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock agent for testing.
//!
//! Keeps scheduled pipelines in memory, records every call, and can be told
//! to fail or stall calls to exercise retry and deadline handling.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use super::traits::*;
use crate::diff::PipelineAction;

/// One call received by a [`MockAgent`].
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    /// Which RPC was called.
    pub action: PipelineAction,
    /// Workflow name.
    pub workflow: String,
    /// Pipeline name.
    pub pipeline: String,
    /// Spec sent with the call.
    pub spec: Value,
}

#[derive(Debug, Clone)]
struct MockPipeline {
    spec: Value,
    last_run: Option<DateTime<Utc>>,
}

/// In-memory agent.
pub struct MockAgent {
    name: String,
    pipelines: Mutex<BTreeMap<(String, String), MockPipeline>>,
    calls: Mutex<Vec<MockCall>>,
    fail_all: AtomicBool,
    fail_next: AtomicUsize,
    delay_ms: AtomicU64,
    reply_delay_ms: AtomicU64,
    serving: AtomicBool,
}

impl MockAgent {
    /// Create a healthy agent.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipelines: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_all: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
            reply_delay_ms: AtomicU64::new(0),
            serving: AtomicBool::new(true),
        }
    }

    /// Create an agent that rejects every pipeline call.
    pub fn failing(name: impl Into<String>) -> Self {
        let agent = Self::new(name);
        agent.set_failing(true);
        agent
    }

    /// Agent name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reject (or stop rejecting) every pipeline call.
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Reject the next `n` pipeline calls.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every pipeline call by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Apply every pipeline call, then wait `delay` before replying.
    pub fn set_reply_delay(&self, delay: Duration) {
        self.reply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Report (or stop reporting) as not serving.
    pub fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::SeqCst);
    }

    /// Every call received so far, in order.
    pub async fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().await.clone()
    }

    /// Calls of one kind received so far.
    pub async fn calls_of(&self, action: PipelineAction) -> Vec<MockCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.action == action)
            .cloned()
            .collect()
    }

    /// Forget recorded calls.
    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    /// Names of the pipelines held, as `workflow/pipeline`.
    pub async fn pipelines(&self) -> Vec<String> {
        self.pipelines
            .lock()
            .await
            .keys()
            .map(|(workflow, pipeline)| format!("{}/{}", workflow, pipeline))
            .collect()
    }

    /// Spec currently held for a pipeline.
    pub async fn pipeline_spec(&self, workflow: &str, pipeline: &str) -> Option<Value> {
        self.pipelines
            .lock()
            .await
            .get(&(workflow.to_string(), pipeline.to_string()))
            .map(|p| p.spec.clone())
    }

    /// Mark a pipeline as having just run.
    pub async fn complete_run(&self, workflow: &str, pipeline: &str) {
        let mut pipelines = self.pipelines.lock().await;
        if let Some(p) = pipelines.get_mut(&(workflow.to_string(), pipeline.to_string())) {
            p.last_run = Some(Utc::now());
        }
    }

    async fn handle(&self, action: PipelineAction, request: PipelineRequest) -> Result<PipelineReport> {
        self.calls.lock().await.push(MockCall {
            action,
            workflow: request.workflow.clone(),
            pipeline: request.pipeline.clone(),
            spec: request.spec.clone(),
        });

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.fail_all.load(Ordering::SeqCst) {
            return Err(AgentError::Rejected {
                agent: self.name.clone(),
                message: format!("mock {} failure", action),
            });
        }

        let key = (request.workflow, request.pipeline);
        let (status, last_run) = self.apply(action, key, request.spec).await;

        let reply_delay = self.reply_delay_ms.load(Ordering::SeqCst);
        if reply_delay > 0 {
            tokio::time::sleep(Duration::from_millis(reply_delay)).await;
        }

        Ok(PipelineReport {
            executor: self.name.clone(),
            status: status.to_string(),
            last_run,
        })
    }

    async fn apply(
        &self,
        action: PipelineAction,
        key: (String, String),
        spec: Value,
    ) -> (&'static str, Option<DateTime<Utc>>) {
        let mut pipelines = self.pipelines.lock().await;
        match action {
            PipelineAction::Schedule | PipelineAction::Update => {
                let entry = pipelines.entry(key).or_insert(MockPipeline {
                    spec: Value::Null,
                    last_run: None,
                });
                entry.spec = spec;
                let status = match action {
                    PipelineAction::Schedule => "scheduled",
                    _ => "updated",
                };
                (status, entry.last_run)
            }
            PipelineAction::Remove => match pipelines.remove(&key) {
                Some(p) => ("removed", p.last_run),
                None => ("absent", None),
            },
        }
    }
}

#[async_trait]
impl AgentConnection for MockAgent {
    async fn schedule_pipeline(&self, request: PipelineRequest) -> Result<PipelineReport> {
        self.handle(PipelineAction::Schedule, request).await
    }

    async fn update_pipeline(&self, request: PipelineRequest) -> Result<PipelineReport> {
        self.handle(PipelineAction::Update, request).await
    }

    async fn remove_pipeline(&self, request: PipelineRequest) -> Result<PipelineReport> {
        self.handle(PipelineAction::Remove, request).await
    }

    async fn status(&self) -> Result<AgentHealth> {
        let state = if self.serving.load(Ordering::SeqCst) {
            HealthState::Serving
        } else {
            HealthState::NotServing
        };
        Ok(AgentHealth {
            agent: self.name.clone(),
            state,
            pipelines: Some(self.pipelines.lock().await.len()),
            message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(pipeline: &str) -> PipelineRequest {
        PipelineRequest {
            workflow: "wf".into(),
            pipeline: pipeline.into(),
            spec: json!({"tasks": []}),
        }
    }

    #[tokio::test]
    async fn test_schedule_and_remove() {
        let agent = MockAgent::new("a");

        let report = agent.schedule_pipeline(request("p1")).await.unwrap();
        assert_eq!(report.executor, "a");
        assert_eq!(report.status, "scheduled");
        assert_eq!(agent.pipelines().await, vec!["wf/p1".to_string()]);

        agent.complete_run("wf", "p1").await;
        let report = agent.remove_pipeline(request("p1")).await.unwrap();
        assert_eq!(report.status, "removed");
        assert!(report.last_run.is_some());
        assert!(agent.pipelines().await.is_empty());

        let report = agent.remove_pipeline(request("p1")).await.unwrap();
        assert_eq!(report.status, "absent");
        assert_eq!(agent.calls().await.len(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let agent = MockAgent::new("a");
        agent.fail_next(1);

        assert!(matches!(
            agent.schedule_pipeline(request("p1")).await,
            Err(AgentError::Rejected { .. })
        ));
        agent.schedule_pipeline(request("p1")).await.unwrap();

        agent.set_failing(true);
        assert!(agent.update_pipeline(request("p1")).await.is_err());
        assert_eq!(agent.calls_of(PipelineAction::Schedule).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_delay_applies_before_replying() {
        let agent = std::sync::Arc::new(MockAgent::new("a"));
        agent.set_reply_delay(Duration::from_secs(5));

        let call = tokio::spawn({
            let agent = agent.clone();
            async move { agent.schedule_pipeline(request("p1")).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(agent.pipelines().await, vec!["wf/p1".to_string()]);
        assert!(!call.is_finished());

        let report = call.await.unwrap().unwrap();
        assert_eq!(report.status, "scheduled");
    }

    #[tokio::test]
    async fn test_status_reports_serving_state() {
        let agent = MockAgent::new("a");
        assert_eq!(agent.status().await.unwrap().state, HealthState::Serving);
        agent.set_serving(false);
        let health = agent.status().await.unwrap();
        assert_eq!(health.state, HealthState::NotServing);
        assert_eq!(health.pipelines, Some(0));
    }
}
