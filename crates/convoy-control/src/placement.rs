// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent selection for newly scheduled pipelines.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::agent::AgentInfo;
use crate::workflow::PipelineSpec;

/// Picks the agent a new pipeline is scheduled on.
pub trait PlacementPolicy: Send + Sync {
    /// Policy name, for logs.
    fn name(&self) -> &'static str;

    /// Choose one of `candidates`, or `None` if none is eligible.
    fn place(
        &self,
        workflow: &str,
        pipeline: &str,
        spec: &PipelineSpec,
        candidates: &[AgentInfo],
    ) -> Option<String>;
}

/// Cycles through all agents, ignoring labels.
#[derive(Debug, Default)]
pub struct RoundRobinPlacement {
    next: AtomicUsize,
}

impl RoundRobinPlacement {
    /// Create a policy starting at the first agent.
    pub fn new() -> Self {
        Self::default()
    }

    fn pick<'a>(&self, candidates: &[&'a AgentInfo]) -> Option<&'a AgentInfo> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index])
    }
}

impl PlacementPolicy for RoundRobinPlacement {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn place(
        &self,
        _workflow: &str,
        _pipeline: &str,
        _spec: &PipelineSpec,
        candidates: &[AgentInfo],
    ) -> Option<String> {
        let all: Vec<&AgentInfo> = candidates.iter().collect();
        self.pick(&all).map(|agent| agent.name.clone())
    }
}

/// Round-robin over the agents carrying every label of the pipeline's
/// `agent_selector`.
#[derive(Debug, Default)]
pub struct LabelPlacement {
    inner: RoundRobinPlacement,
}

impl LabelPlacement {
    /// Create a label-matching policy.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlacementPolicy for LabelPlacement {
    fn name(&self) -> &'static str {
        "label"
    }

    fn place(
        &self,
        _workflow: &str,
        _pipeline: &str,
        spec: &PipelineSpec,
        candidates: &[AgentInfo],
    ) -> Option<String> {
        let eligible: Vec<&AgentInfo> = candidates
            .iter()
            .filter(|agent| agent.matches(&spec.agent_selector))
            .collect();
        self.inner.pick(&eligible).map(|agent| agent.name.clone())
    }
}

/// Configurable choice of built-in placement policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlacementKind {
    /// [`RoundRobinPlacement`].
    #[default]
    RoundRobin,
    /// [`LabelPlacement`].
    Label,
}

impl PlacementKind {
    /// Instantiate the policy.
    pub fn build(self) -> Arc<dyn PlacementPolicy> {
        match self {
            PlacementKind::RoundRobin => Arc::new(RoundRobinPlacement::new()),
            PlacementKind::Label => Arc::new(LabelPlacement::new()),
        }
    }
}

impl FromStr for PlacementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Ok(PlacementKind::RoundRobin),
            "label" | "labels" => Ok(PlacementKind::Label),
            other => Err(format!("unknown placement policy {:?}", other)),
        }
    }
}

impl fmt::Display for PlacementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementKind::RoundRobin => write!(f, "round-robin"),
            PlacementKind::Label => write!(f, "label"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn agent(name: &str, labels: &[(&str, &str)]) -> AgentInfo {
        AgentInfo {
            name: name.into(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let policy = RoundRobinPlacement::new();
        let agents = vec![agent("a", &[]), agent("b", &[])];
        let spec = PipelineSpec::default();

        let picks: Vec<_> = (0..4)
            .map(|_| policy.place("wf", "p", &spec, &agents).unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
        assert!(policy.place("wf", "p", &spec, &[]).is_none());
    }

    #[test]
    fn test_label_placement_filters() {
        let policy = LabelPlacement::new();
        let agents = vec![
            agent("a", &[("zone", "us")]),
            agent("b", &[("zone", "eu"), ("gpu", "true")]),
            agent("c", &[("zone", "eu")]),
        ];

        let mut spec = PipelineSpec::default();
        spec.agent_selector = BTreeMap::from([("zone".into(), "eu".into())]);
        let picks: Vec<_> = (0..2)
            .map(|_| policy.place("wf", "p", &spec, &agents).unwrap())
            .collect();
        assert_eq!(picks, vec!["b", "c"]);

        spec.agent_selector.insert("gpu".into(), "true".into());
        assert_eq!(policy.place("wf", "p", &spec, &agents).as_deref(), Some("b"));

        spec.agent_selector.insert("zone".into(), "ap".into());
        assert!(policy.place("wf", "p", &spec, &agents).is_none());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("round-robin".parse::<PlacementKind>(), Ok(PlacementKind::RoundRobin));
        assert_eq!("LABEL".parse::<PlacementKind>(), Ok(PlacementKind::Label));
        assert!("random".parse::<PlacementKind>().is_err());
        assert_eq!(PlacementKind::Label.build().name(), "label");
        assert_eq!(PlacementKind::default().to_string(), "round-robin");
    }
}
