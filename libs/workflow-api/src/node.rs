//! Runtime node graph of a workflow

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::template::{Inputs, Outputs};

/// Phase of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodePhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
    Skipped,
}

impl NodePhase {
    /// Succeeded, Failed or Error
    pub fn completed(&self) -> bool {
        matches!(self, NodePhase::Succeeded | NodePhase::Failed | NodePhase::Error)
    }

    /// Completed or Skipped; a fulfilled node never changes phase again
    pub fn fulfilled(&self) -> bool {
        self.completed() || *self == NodePhase::Skipped
    }

    pub fn failed_or_error(&self) -> bool {
        matches!(self, NodePhase::Failed | NodePhase::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodePhase::Pending => "Pending",
            NodePhase::Running => "Running",
            NodePhase::Succeeded => "Succeeded",
            NodePhase::Failed => "Failed",
            NodePhase::Error => "Error",
            NodePhase::Skipped => "Skipped",
        }
    }

    /// Severity used to collapse several phases into the worst one
    pub fn severity(&self) -> u8 {
        match self {
            NodePhase::Error => 3,
            NodePhase::Failed => 2,
            NodePhase::Succeeded | NodePhase::Skipped => 1,
            NodePhase::Pending | NodePhase::Running => 0,
        }
    }
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of node, mirroring the template variant that produced it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[default]
    Pod,
    Container,
    Steps,
    StepGroup,
    #[serde(rename = "DAG")]
    Dag,
    TaskGroup,
    Retry,
    Skipped,
    Suspend,
    #[serde(rename = "HTTP")]
    Http,
}

impl NodeType {
    /// Nodes whose phase is derived from their children
    pub fn is_boundary(&self) -> bool {
        matches!(self, NodeType::Steps | NodeType::Dag)
    }
}

/// Status of one node of the workflow graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: String,

    /// Fully qualified name, e.g. `wf[0].step-a(1)`
    pub name: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template_name: String,

    #[serde(default)]
    pub phase: NodePhase,

    #[serde(rename = "boundaryID", default, skip_serializing_if = "String::is_empty")]
    pub boundary_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Predicted duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<i64>,

    /// Self-reported progress, `N/M`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Inputs>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_node_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemoned: Option<bool>,
}

impl NodeStatus {
    pub fn fulfilled(&self) -> bool {
        self.phase.fulfilled()
    }

    pub fn completed(&self) -> bool {
        self.phase.completed()
    }

    pub fn succeeded(&self) -> bool {
        self.phase == NodePhase::Succeeded
    }

    /// Move to `phase`; a fulfilled node keeps its phase. Returns whether it changed.
    pub fn mark_phase(&mut self, phase: NodePhase, message: &str, now: DateTime<Utc>) -> bool {
        if self.phase.fulfilled() || (self.phase == phase && self.message == message) {
            return false;
        }
        self.phase = phase;
        if !message.is_empty() {
            self.message = message.to_string();
        }
        if phase == NodePhase::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if phase.fulfilled() {
            if self.started_at.is_none() {
                self.started_at = Some(now);
            }
            self.finished_at = Some(now);
        }
        true
    }

    /// Timestamp used to order sibling nodes: finished, else started, else `now`
    pub fn sort_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.finished_at.or(self.started_at).unwrap_or(now)
    }
}

/// Node map keyed by node ID
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nodes(BTreeMap<String, NodeStatus>);

impl Nodes {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, id: &str) -> Option<&NodeStatus> {
        self.0.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut NodeStatus> {
        self.0.get_mut(id)
    }

    pub fn insert(&mut self, node: NodeStatus) {
        self.0.insert(node.id.clone(), node);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<NodeStatus> {
        self.0.remove(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeStatus> {
        self.0.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeStatus> {
        self.0.values_mut()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&NodeStatus> {
        self.0.values().find(|n| n.name == name)
    }

    pub fn find_by_display_name(&self, display_name: &str) -> Option<&NodeStatus> {
        self.0.values().find(|n| n.display_name == display_name)
    }

    /// Child nodes of `id`, in child-list order
    pub fn children(&self, id: &str) -> Vec<&NodeStatus> {
        self.0
            .get(id)
            .map(|n| n.children.iter().filter_map(|c| self.0.get(c)).collect())
            .unwrap_or_default()
    }

    /// Append `child` to the children of `parent`, once
    pub fn add_child(&mut self, parent: &str, child: &str) {
        if let Some(node) = self.0.get_mut(parent) {
            if !node.children.iter().any(|c| c == child) {
                node.children.push(child.to_string());
            }
        }
    }
}

/// Result reported for a node by the executor or the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<NodePhase>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,
}

impl NodeResult {
    pub fn fulfilled(&self) -> bool {
        self.phase.map(|p| p.fulfilled()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_helpers() {
        assert!(NodePhase::Skipped.fulfilled());
        assert!(!NodePhase::Skipped.completed());
        assert!(NodePhase::Error.failed_or_error());
        assert!(!NodePhase::Running.fulfilled());
    }

    #[test]
    fn test_mark_phase_never_leaves_terminal() {
        let now = Utc::now();
        let mut node = NodeStatus {
            id: "wf-1".to_string(),
            ..Default::default()
        };
        assert!(node.mark_phase(NodePhase::Running, "", now));
        assert!(node.mark_phase(NodePhase::Failed, "exit 1", now));
        assert!(!node.mark_phase(NodePhase::Succeeded, "", now));
        assert_eq!(node.phase, NodePhase::Failed);
        assert_eq!(node.message, "exit 1");
        assert!(node.finished_at.is_some());
    }

    #[test]
    fn test_node_type_serde_names() {
        assert_eq!(serde_json::to_string(&NodeType::Dag).unwrap(), "\"DAG\"");
        assert_eq!(serde_json::to_string(&NodeType::Http).unwrap(), "\"HTTP\"");
        let t: NodeType = serde_json::from_str("\"TaskGroup\"").unwrap();
        assert_eq!(t, NodeType::TaskGroup);
    }
}
