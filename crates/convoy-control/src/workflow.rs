// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow manifests.
//!
//! A workflow is a named set of pipelines. Each pipeline lists its triggers
//! and tasks; a pipeline may be triggered by the completion of another
//! pipeline of the same workflow, which [`WorkflowSpec::resolve_triggers`]
//! turns into the derived `downstream` lists.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Key prefix of workflow manifests.
pub const WORKFLOW_PREFIX: &str = "workflows/";

/// Store key of a workflow manifest.
pub fn workflow_key(name: &str) -> String {
    format!("{}{}", WORKFLOW_PREFIX, name)
}

/// Workflow name encoded in a manifest key.
pub fn workflow_name_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(WORKFLOW_PREFIX)
        .filter(|name| !name.is_empty())
}

/// Manifest validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// The manifest is not valid JSON for a workflow.
    #[error("Malformed manifest: {0}")]
    Malformed(String),

    /// A workflow, pipeline or task name is empty or contains `/`.
    #[error("Invalid name {0:?}")]
    InvalidName(String),

    /// The manifest's name differs from the name in its key.
    #[error("Manifest name {manifest:?} does not match key name {key:?}")]
    NameMismatch {
        /// Name derived from the key.
        key: String,
        /// Name inside the manifest.
        manifest: String,
    },

    /// A cron trigger has an unparsable schedule.
    #[error("Pipeline {pipeline}: invalid cron schedule {schedule:?}: {reason}")]
    InvalidSchedule {
        /// Pipeline name.
        pipeline: String,
        /// Offending schedule.
        schedule: String,
        /// Parser message.
        reason: String,
    },

    /// A pipeline trigger names a pipeline that does not exist.
    #[error("Pipeline {pipeline}: trigger references unknown pipeline {target}")]
    UnknownTriggerTarget {
        /// Pipeline name.
        pipeline: String,
        /// Referenced pipeline.
        target: String,
    },

    /// A pipeline triggers itself.
    #[error("Pipeline {0} triggers itself")]
    SelfTrigger(String),

    /// Pipeline triggers form a cycle.
    #[error("Pipeline triggers form a cycle through {0}")]
    TriggerCycle(String),

    /// A pipeline has a task without an image.
    #[error("Pipeline {pipeline}: task {task} has no image")]
    MissingImage {
        /// Pipeline name.
        pipeline: String,
        /// Task name.
        task: String,
    },

    /// Two tasks of one pipeline share a name.
    #[error("Pipeline {pipeline}: duplicate task {task}")]
    DuplicateTask {
        /// Pipeline name.
        pipeline: String,
        /// Task name.
        task: String,
    },
}

/// What starts a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Time-based, standard cron syntax.
    Cron {
        /// Cron expression.
        schedule: String,
    },
    /// Started on demand only.
    Manual,
    /// Completion of another pipeline of the same workflow.
    Pipeline {
        /// Upstream pipeline name.
        name: String,
    },
}

/// One opaque unit of work run by the agent's executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task name, unique within its pipeline.
    pub name: String,
    /// Container image.
    pub image: String,
    /// Commands run in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    /// Environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Desired state of one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Triggers starting this pipeline.
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Tasks run by this pipeline.
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    /// Labels an agent must carry to run this pipeline.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub agent_selector: BTreeMap<String, String>,
    /// Pipelines triggered by this one. Derived, never read from clients.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub downstream: Vec<String>,
}

impl PipelineSpec {
    /// Upstream pipelines named by this pipeline's triggers.
    pub fn upstream(&self) -> impl Iterator<Item = &str> {
        self.triggers.iter().filter_map(|t| match t {
            Trigger::Pipeline { name } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Structural fingerprint. Two specs are equal iff their fingerprints are.
    pub fn fingerprint(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Short SHA-256 digest of the fingerprint, for logs.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(&self.fingerprint()).unwrap_or_default();
        let hash = format!("{:x}", Sha256::digest(&bytes));
        hash[..12].to_string()
    }

    /// Whether the two specs differ structurally.
    pub fn differs_from(&self, other: &PipelineSpec) -> bool {
        self.fingerprint() != other.fingerprint()
    }
}

/// Declarative workflow manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Workflow name, unique in the store.
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Pipelines keyed by name.
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineSpec>,
}

impl WorkflowSpec {
    /// Workflow with no pipelines.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Decode and validate a manifest stored under `key_name`.
    ///
    /// Client-supplied `downstream` lists are discarded and re-derived.
    pub fn from_manifest(key_name: &str, data: &[u8]) -> Result<Self, ValidationError> {
        let mut spec: WorkflowSpec = serde_json::from_slice(data)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        if spec.name != key_name {
            return Err(ValidationError::NameMismatch {
                key: key_name.to_string(),
                manifest: spec.name,
            });
        }
        spec.validate()?;
        spec.resolve_triggers();
        Ok(spec)
    }

    /// Check names, schedules, tasks and trigger references.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_name(&self.name)?;

        for (name, pipeline) in &self.pipelines {
            check_name(name)?;

            for trigger in &pipeline.triggers {
                match trigger {
                    Trigger::Cron { schedule } => check_schedule(name, schedule)?,
                    Trigger::Manual => {}
                    Trigger::Pipeline { name: target } if target == name => {
                        return Err(ValidationError::SelfTrigger(name.clone()));
                    }
                    Trigger::Pipeline { name: target } => {
                        if !self.pipelines.contains_key(target) {
                            return Err(ValidationError::UnknownTriggerTarget {
                                pipeline: name.clone(),
                                target: target.clone(),
                            });
                        }
                    }
                }
            }

            let mut seen = BTreeSet::new();
            for task in &pipeline.tasks {
                check_name(&task.name)?;
                if task.image.trim().is_empty() {
                    return Err(ValidationError::MissingImage {
                        pipeline: name.clone(),
                        task: task.name.clone(),
                    });
                }
                if !seen.insert(task.name.as_str()) {
                    return Err(ValidationError::DuplicateTask {
                        pipeline: name.clone(),
                        task: task.name.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    /// Fill every pipeline's `downstream` from the pipeline triggers.
    ///
    /// Idempotent. References to unknown pipelines are ignored.
    pub fn resolve_triggers(&mut self) {
        let mut downstream: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, pipeline) in &self.pipelines {
            for upstream in pipeline.upstream() {
                downstream
                    .entry(upstream.to_string())
                    .or_default()
                    .insert(name.clone());
            }
        }

        for (name, pipeline) in self.pipelines.iter_mut() {
            pipeline.downstream = downstream
                .remove(name)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default();
        }
    }

    /// Short digest over all pipelines, for logs.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(&self.pipelines).unwrap_or_default();
        let hash = format!("{:x}", Sha256::digest(&bytes));
        hash[..12].to_string()
    }

    fn check_acyclic(&self) -> Result<(), ValidationError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            spec: &'a WorkflowSpec,
            name: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
        ) -> Result<(), ValidationError> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(ValidationError::TriggerCycle(name.to_string())),
                None => {}
            }
            marks.insert(name, Mark::Visiting);
            if let Some(pipeline) = spec.pipelines.get(name) {
                for upstream in pipeline.upstream() {
                    visit(spec, upstream, marks)?;
                }
            }
            marks.insert(name, Mark::Done);
            Ok(())
        }

        let mut marks = BTreeMap::new();
        for name in self.pipelines.keys() {
            visit(self, name, &mut marks)?;
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() || name.contains('/') {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn check_schedule(pipeline: &str, schedule: &str) -> Result<(), ValidationError> {
    croner::Cron::new(schedule)
        .parse()
        .map(|_| ())
        .map_err(|e| ValidationError::InvalidSchedule {
            pipeline: pipeline.to_string(),
            schedule: schedule.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    fn pipeline_after(upstream: &str) -> PipelineSpec {
        PipelineSpec {
            triggers: vec![Trigger::Pipeline {
                name: upstream.to_string(),
            }],
            ..PipelineSpec::default()
        }
    }

    #[test]
    fn test_key_helpers() {
        assert_eq!(workflow_key("wf1"), "workflows/wf1");
        assert_eq!(workflow_name_from_key("workflows/wf1"), Some("wf1"));
        assert_eq!(workflow_name_from_key("workflows/"), None);
        assert_eq!(workflow_name_from_key("status/workflows/wf1"), None);
    }

    #[test]
    fn test_manifest_decodes_and_resolves_downstream() {
        let data = manifest(json!({
            "name": "wf1",
            "pipelines": {
                "build": {
                    "triggers": [{"type": "cron", "schedule": "0 * * * *"}],
                    "tasks": [{"name": "compile", "image": "rust:1", "commands": ["cargo build"]}],
                    "downstream": ["bogus"]
                },
                "deploy": {
                    "triggers": [{"type": "pipeline", "name": "build"}, {"type": "manual"}],
                    "tasks": [{"name": "ship", "image": "alpine"}]
                }
            }
        }));

        let spec = WorkflowSpec::from_manifest("wf1", &data).unwrap();
        assert_eq!(spec.pipelines["build"].downstream, vec!["deploy".to_string()]);
        assert!(spec.pipelines["deploy"].downstream.is_empty());
    }

    #[test]
    fn test_name_mismatch_rejected() {
        let data = manifest(json!({"name": "other"}));
        assert!(matches!(
            WorkflowSpec::from_manifest("wf1", &data),
            Err(ValidationError::NameMismatch { .. })
        ));
    }

    #[test]
    fn test_malformed_manifest_rejected() {
        assert!(matches!(
            WorkflowSpec::from_manifest("wf1", b"not json"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_trigger_references_checked() {
        let mut spec = WorkflowSpec::empty("wf");
        spec.pipelines.insert("a".into(), pipeline_after("missing"));
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::UnknownTriggerTarget { .. })
        ));

        let mut spec = WorkflowSpec::empty("wf");
        spec.pipelines.insert("a".into(), pipeline_after("a"));
        assert_eq!(spec.validate(), Err(ValidationError::SelfTrigger("a".into())));

        let mut spec = WorkflowSpec::empty("wf");
        spec.pipelines.insert("a".into(), pipeline_after("b"));
        spec.pipelines.insert("b".into(), pipeline_after("a"));
        assert!(matches!(spec.validate(), Err(ValidationError::TriggerCycle(_))));
    }

    #[test]
    fn test_bad_cron_rejected() {
        let mut spec = WorkflowSpec::empty("wf");
        spec.pipelines.insert(
            "a".into(),
            PipelineSpec {
                triggers: vec![Trigger::Cron {
                    schedule: "every tuesday".into(),
                }],
                ..PipelineSpec::default()
            },
        );
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn test_task_checks() {
        let task = |name: &str, image: &str| TaskSpec {
            name: name.into(),
            image: image.into(),
            commands: vec![],
            env: BTreeMap::new(),
        };

        let mut spec = WorkflowSpec::empty("wf");
        spec.pipelines.insert(
            "a".into(),
            PipelineSpec {
                tasks: vec![task("t", "")],
                ..PipelineSpec::default()
            },
        );
        assert!(matches!(spec.validate(), Err(ValidationError::MissingImage { .. })));

        spec.pipelines.get_mut("a").unwrap().tasks = vec![task("t", "img"), task("t", "img")];
        assert!(matches!(spec.validate(), Err(ValidationError::DuplicateTask { .. })));
    }

    #[test]
    fn test_resolve_triggers_is_idempotent() {
        let mut spec = WorkflowSpec::empty("wf");
        spec.pipelines.insert("a".into(), PipelineSpec::default());
        spec.pipelines.insert("b".into(), pipeline_after("a"));
        spec.pipelines.insert("c".into(), pipeline_after("a"));

        spec.resolve_triggers();
        let once = spec.clone();
        spec.resolve_triggers();
        assert_eq!(spec, once);
        assert_eq!(spec.pipelines["a"].downstream, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_fingerprint_tracks_structure() {
        let a = pipeline_after("x");
        let mut b = a.clone();
        assert!(!a.differs_from(&b));
        assert_eq!(a.digest(), b.digest());

        b.agent_selector.insert("zone".into(), "eu".into());
        assert!(a.differs_from(&b));
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 12);
    }
}
