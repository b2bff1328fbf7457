//! Task results and task sets exchanged between the executor and the controller

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::{ObjectMeta, Resource};
use crate::node::NodeResult;
use crate::template::Template;

/// Outputs of one node, written by the executor and keyed by node ID
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTaskResult {
    #[serde(default = "crate::api_version")]
    pub api_version: String,

    #[serde(default = "task_result_kind")]
    pub kind: String,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(flatten)]
    pub result: NodeResult,
}

fn task_result_kind() -> String {
    WorkflowTaskResult::KIND.to_string()
}

impl WorkflowTaskResult {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            api_version: crate::api_version(),
            kind: task_result_kind(),
            metadata,
            result: NodeResult::default(),
        }
    }

    /// Whether the executor finished reporting every output
    pub fn outputs_completed(&self) -> bool {
        self.metadata
            .label(crate::common::LABEL_KEY_REPORT_OUTPUTS_COMPLETED)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

impl Resource for WorkflowTaskResult {
    const KIND: &'static str = "WorkflowTaskResult";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTaskSetSpec {
    /// Node ID to the template the agent should run
    #[serde(default)]
    pub tasks: BTreeMap<String, Template>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTaskSetStatus {
    /// Node ID to the result the agent produced
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeResult>,
}

/// Work handed to the agent pod of a workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTaskSet {
    #[serde(default = "crate::api_version")]
    pub api_version: String,

    #[serde(default = "task_set_kind")]
    pub kind: String,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: WorkflowTaskSetSpec,

    #[serde(default)]
    pub status: WorkflowTaskSetStatus,
}

fn task_set_kind() -> String {
    WorkflowTaskSet::KIND.to_string()
}

impl WorkflowTaskSet {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            api_version: crate::api_version(),
            kind: task_set_kind(),
            metadata,
            ..Default::default()
        }
    }

    /// Tasks without a fulfilled result yet
    pub fn pending_tasks(&self) -> Vec<(&String, &Template)> {
        self.spec
            .tasks
            .iter()
            .filter(|(id, _)| {
                self.status
                    .nodes
                    .get(*id)
                    .map(|r| !r.fulfilled())
                    .unwrap_or(true)
            })
            .collect()
    }
}

impl Resource for WorkflowTaskSet {
    const KIND: &'static str = "WorkflowTaskSet";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodePhase;

    #[test]
    fn test_task_result_flattens_node_result() {
        let result: WorkflowTaskResult = serde_json::from_str(
            r#"{"metadata":{"name":"wf-1","labels":{"workflows.argoproj.io/report-outputs-completed":"true"}},
                "phase":"Succeeded","outputs":{"result":"hello"}}"#,
        )
        .unwrap();
        assert_eq!(result.result.phase, Some(NodePhase::Succeeded));
        assert_eq!(result.result.outputs.unwrap().result.as_deref(), Some("hello"));
        assert!(result.metadata.label("workflows.argoproj.io/report-outputs-completed").is_some());
    }

    #[test]
    fn test_pending_tasks() {
        let mut set = WorkflowTaskSet::default();
        set.spec.tasks.insert("a".to_string(), Template::default());
        set.spec.tasks.insert("b".to_string(), Template::default());
        set.status.nodes.insert(
            "a".to_string(),
            NodeResult {
                phase: Some(NodePhase::Succeeded),
                ..Default::default()
            },
        );
        let pending: Vec<_> = set.pending_tasks().into_iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(pending, vec!["b".to_string()]);
    }
}
