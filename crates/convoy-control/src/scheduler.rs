// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-pipeline dispatch to agents.
//!
//! The scheduler resolves the agent for each action, sends the RPC under a
//! deadline, and overlays the agent's report onto the pipeline's status.
//! It never touches the store; persisting the result is the caller's job.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::agent::{
    AgentDirectory, AgentError, AgentHealth, PipelineReport, PipelineRequest, Result,
};
use crate::diff::PipelineAction;
use crate::placement::PlacementPolicy;
use crate::status::{PipelineStatus, UNKNOWN_STATUS};
use crate::workflow::PipelineSpec;

/// Default deadline of one agent call.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Dispatches pipeline actions to agents.
pub struct Scheduler {
    directory: Arc<dyn AgentDirectory>,
    placement: Arc<dyn PlacementPolicy>,
    dispatch_timeout: Duration,
}

impl Scheduler {
    /// Create a scheduler.
    pub fn new(directory: Arc<dyn AgentDirectory>, placement: Arc<dyn PlacementPolicy>) -> Self {
        Self {
            directory,
            placement,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }

    /// Set the deadline of each agent call.
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Deadline of each agent call.
    pub fn dispatch_timeout(&self) -> Duration {
        self.dispatch_timeout
    }

    /// Run `action` for one pipeline.
    pub async fn dispatch(
        &self,
        action: PipelineAction,
        workflow: &str,
        pipeline: &str,
        spec: &PipelineSpec,
        status: &mut PipelineStatus,
    ) -> Result<()> {
        match action {
            PipelineAction::Schedule => {
                self.schedule_pipeline(workflow, pipeline, spec, status)
                    .await
            }
            PipelineAction::Update => self.update_pipeline(workflow, pipeline, spec, status).await,
            PipelineAction::Remove => self.remove_pipeline(workflow, pipeline, spec, status).await,
        }
    }

    /// Place a pipeline on the agent chosen by the placement policy.
    ///
    /// An executor already recorded in `status` (left by a schedule call
    /// that timed out) is reused while the directory still knows it. A
    /// timed-out call records the attempted agent with [`UNKNOWN_STATUS`]
    /// before returning the error.
    pub async fn schedule_pipeline(
        &self,
        workflow: &str,
        pipeline: &str,
        spec: &PipelineSpec,
        status: &mut PipelineStatus,
    ) -> Result<()> {
        let previous = match status.executor.clone() {
            Some(agent) => match self.directory.connection(&agent).await {
                Ok(connection) => Some((agent, connection)),
                Err(e) => {
                    debug!(
                        workflow = %workflow,
                        pipeline = %pipeline,
                        agent = %agent,
                        error = %e,
                        "Previous executor unavailable, placing again"
                    );
                    None
                }
            },
            None => None,
        };

        let (agent, connection) = match previous {
            Some(found) => found,
            None => {
                let candidates = self.directory.agents().await;
                let agent = self
                    .placement
                    .place(workflow, pipeline, spec, &candidates)
                    .ok_or_else(|| {
                        AgentError::NoCandidate(format!("{}/{}", workflow, pipeline))
                    })?;
                debug!(
                    workflow = %workflow,
                    pipeline = %pipeline,
                    agent = %agent,
                    policy = self.placement.name(),
                    "Placed pipeline"
                );
                let connection = self.directory.connection(&agent).await?;
                (agent, connection)
            }
        };

        let request = Self::request(workflow, pipeline, spec)?;
        let report = match self
            .call(&agent, connection.schedule_pipeline(request))
            .await
        {
            Ok(report) => report,
            Err(e @ AgentError::Timeout { .. }) => {
                // The agent may have accepted the pipeline before the deadline.
                warn!(
                    workflow = %workflow,
                    pipeline = %pipeline,
                    agent = %agent,
                    "Schedule outcome unknown"
                );
                status.executor = Some(agent);
                status.status = UNKNOWN_STATUS.to_string();
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        Self::overlay(status, report);

        info!(
            workflow = %workflow,
            pipeline = %pipeline,
            agent = %agent,
            digest = %spec.digest(),
            "Pipeline scheduled"
        );
        Ok(())
    }

    /// Send a new spec to the agent recorded in `status`.
    ///
    /// A pipeline that was never placed is scheduled instead.
    pub async fn update_pipeline(
        &self,
        workflow: &str,
        pipeline: &str,
        spec: &PipelineSpec,
        status: &mut PipelineStatus,
    ) -> Result<()> {
        let Some(agent) = status.executor.clone() else {
            debug!(workflow = %workflow, pipeline = %pipeline, "No executor recorded, scheduling");
            return self.schedule_pipeline(workflow, pipeline, spec, status).await;
        };

        let connection = self.directory.connection(&agent).await?;
        let request = Self::request(workflow, pipeline, spec)?;
        let report = self
            .call(&agent, connection.update_pipeline(request))
            .await?;
        Self::overlay(status, report);

        info!(
            workflow = %workflow,
            pipeline = %pipeline,
            agent = %agent,
            digest = %spec.digest(),
            "Pipeline updated"
        );
        Ok(())
    }

    /// Remove a pipeline from the agent recorded in `status`.
    ///
    /// Succeeds without a call when the pipeline was never placed.
    pub async fn remove_pipeline(
        &self,
        workflow: &str,
        pipeline: &str,
        spec: &PipelineSpec,
        status: &mut PipelineStatus,
    ) -> Result<()> {
        let Some(agent) = status.executor.clone() else {
            debug!(workflow = %workflow, pipeline = %pipeline, "Pipeline was never placed");
            return Ok(());
        };

        let connection = self.directory.connection(&agent).await?;
        let request = Self::request(workflow, pipeline, spec)?;
        let report = self
            .call(&agent, connection.remove_pipeline(request))
            .await?;
        Self::overlay(status, report);

        info!(workflow = %workflow, pipeline = %pipeline, agent = %agent, "Pipeline removed");
        Ok(())
    }

    /// Query every known agent. Agents that fail to answer are reported as
    /// unreachable.
    pub async fn agent_health(&self) -> Vec<AgentHealth> {
        let mut health = Vec::new();
        for agent in self.directory.agents().await {
            let result = match self.directory.connection(&agent.name).await {
                Ok(connection) => self.call(&agent.name, connection.status()).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(h) => health.push(h),
                Err(e) => {
                    warn!(agent = %agent.name, error = %e, "Agent status query failed");
                    health.push(AgentHealth::unreachable(agent.name, e.to_string()));
                }
            }
        }
        health
    }

    fn request(workflow: &str, pipeline: &str, spec: &PipelineSpec) -> Result<PipelineRequest> {
        Ok(PipelineRequest {
            workflow: workflow.to_string(),
            pipeline: pipeline.to_string(),
            spec: serde_json::to_value(spec)?,
        })
    }

    async fn call<T>(
        &self,
        agent: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.dispatch_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                agent: agent.to_string(),
                timeout: self.dispatch_timeout,
            }),
        }
    }

    /// Overlay the fields the agent reported onto the local status.
    fn overlay(status: &mut PipelineStatus, report: PipelineReport) {
        if !report.executor.is_empty() {
            status.executor = Some(report.executor);
        }
        if !report.status.is_empty() {
            status.status = report.status;
        }
        if report.last_run.is_some() {
            status.last_run = report.last_run;
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("placement", &self.placement.name())
            .field("dispatch_timeout", &self.dispatch_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{HealthState, MockAgent, StaticAgentDirectory};
    use crate::placement::{LabelPlacement, RoundRobinPlacement};
    use std::collections::BTreeMap;

    async fn scheduler_with(agents: &[(&str, Arc<MockAgent>)]) -> Scheduler {
        let directory = Arc::new(StaticAgentDirectory::new());
        for (name, agent) in agents {
            directory
                .register(*name, BTreeMap::new(), agent.clone())
                .await;
        }
        Scheduler::new(directory, Arc::new(RoundRobinPlacement::new()))
    }

    #[tokio::test]
    async fn test_schedule_records_executor() {
        let agent = Arc::new(MockAgent::new("agent-a"));
        let scheduler = scheduler_with(&[("agent-a", agent.clone())]).await;
        let mut status = PipelineStatus::default();

        scheduler
            .schedule_pipeline("wf", "p1", &PipelineSpec::default(), &mut status)
            .await
            .unwrap();

        assert_eq!(status.executor.as_deref(), Some("agent-a"));
        assert_eq!(status.status, "scheduled");
        assert_eq!(agent.pipelines().await, vec!["wf/p1".to_string()]);
    }

    #[tokio::test]
    async fn test_no_agents_fails_fast() {
        let scheduler = scheduler_with(&[]).await;
        let mut status = PipelineStatus::default();
        let err = scheduler
            .schedule_pipeline("wf", "p1", &PipelineSpec::default(), &mut status)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NoCandidate(_)));
        assert_eq!(status, PipelineStatus::default());
    }

    #[tokio::test]
    async fn test_update_and_remove_use_recorded_executor() {
        let a = Arc::new(MockAgent::new("agent-a"));
        let b = Arc::new(MockAgent::new("agent-b"));
        let scheduler = scheduler_with(&[("agent-a", a.clone()), ("agent-b", b.clone())]).await;
        let mut status = PipelineStatus {
            executor: Some("agent-b".into()),
            ..PipelineStatus::default()
        };

        scheduler
            .update_pipeline("wf", "p1", &PipelineSpec::default(), &mut status)
            .await
            .unwrap();
        scheduler
            .remove_pipeline("wf", "p1", &PipelineSpec::default(), &mut status)
            .await
            .unwrap();

        assert!(a.calls().await.is_empty());
        assert_eq!(b.calls().await.len(), 2);
        assert_eq!(status.status, "removed");
    }

    #[tokio::test]
    async fn test_remove_unknown_executor_fails() {
        let scheduler = scheduler_with(&[]).await;
        let mut status = PipelineStatus {
            executor: Some("gone".into()),
            ..PipelineStatus::default()
        };
        let err = scheduler
            .remove_pipeline("wf", "p1", &PipelineSpec::default(), &mut status)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Unavailable(name) if name == "gone"));

        let mut never_placed = PipelineStatus::default();
        scheduler
            .remove_pipeline("wf", "p1", &PipelineSpec::default(), &mut never_placed)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_deadline() {
        let agent = Arc::new(MockAgent::new("slow"));
        agent.set_delay(Duration::from_secs(60));
        let scheduler = scheduler_with(&[("slow", agent.clone())])
            .await
            .with_dispatch_timeout(Duration::from_secs(1));
        let mut status = PipelineStatus::default();

        let err = scheduler
            .dispatch(
                PipelineAction::Schedule,
                "wf",
                "p1",
                &PipelineSpec::default(),
                &mut status,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
        assert_eq!(status.executor.as_deref(), Some("slow"));
        assert_eq!(status.status, UNKNOWN_STATUS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_after_timeout_returns_to_attempted_agent() {
        let a = Arc::new(MockAgent::new("agent-a"));
        let b = Arc::new(MockAgent::new("agent-b"));
        a.set_reply_delay(Duration::from_secs(60));
        let scheduler = scheduler_with(&[("agent-a", a.clone()), ("agent-b", b.clone())])
            .await
            .with_dispatch_timeout(Duration::from_secs(1));
        let mut status = PipelineStatus::default();

        let err = scheduler
            .schedule_pipeline("wf", "p1", &PipelineSpec::default(), &mut status)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
        assert_eq!(status.executor.as_deref(), Some("agent-a"));

        a.set_reply_delay(Duration::ZERO);
        scheduler
            .schedule_pipeline("wf", "p1", &PipelineSpec::default(), &mut status)
            .await
            .unwrap();

        assert_eq!(status.executor.as_deref(), Some("agent-a"));
        assert_eq!(status.status, "scheduled");
        assert_eq!(a.calls_of(PipelineAction::Schedule).await.len(), 2);
        assert!(b.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_places_again_when_recorded_agent_is_gone() {
        let b = Arc::new(MockAgent::new("agent-b"));
        let scheduler = scheduler_with(&[("agent-b", b.clone())]).await;
        let mut status = PipelineStatus {
            executor: Some("gone".into()),
            status: UNKNOWN_STATUS.into(),
            ..PipelineStatus::default()
        };

        scheduler
            .schedule_pipeline("wf", "p1", &PipelineSpec::default(), &mut status)
            .await
            .unwrap();

        assert_eq!(status.executor.as_deref(), Some("agent-b"));
        assert_eq!(b.pipelines().await, vec!["wf/p1".to_string()]);
    }

    #[tokio::test]
    async fn test_label_placement_without_match() {
        let directory = Arc::new(StaticAgentDirectory::new());
        directory
            .register(
                "agent-a",
                BTreeMap::from([("zone".to_string(), "us".to_string())]),
                Arc::new(MockAgent::new("agent-a")),
            )
            .await;
        let scheduler = Scheduler::new(directory, Arc::new(LabelPlacement::new()));

        let mut spec = PipelineSpec::default();
        spec.agent_selector.insert("zone".into(), "eu".into());
        let mut status = PipelineStatus::default();
        assert!(matches!(
            scheduler.schedule_pipeline("wf", "p1", &spec, &mut status).await,
            Err(AgentError::NoCandidate(_))
        ));
    }

    #[tokio::test]
    async fn test_agent_health() {
        let a = Arc::new(MockAgent::new("agent-a"));
        let b = Arc::new(MockAgent::new("agent-b"));
        b.set_serving(false);
        let scheduler = scheduler_with(&[("agent-a", a), ("agent-b", b)]).await;

        let health = scheduler.agent_health().await;
        assert_eq!(health.len(), 2);
        assert_eq!(health[0].state, HealthState::Serving);
        assert_eq!(health[1].state, HealthState::NotServing);
    }
}
