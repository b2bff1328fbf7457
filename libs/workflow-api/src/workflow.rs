//! Workflow and workflow template resources

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::de::opt_any_string;
use crate::meta::{ObjectMeta, Resource};
use crate::node::{NodePhase, Nodes};
use crate::pod::Volume;
use crate::template::{Arguments, Outputs, Template};

/// Phase of a workflow; terminal phases never change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowPhase {
    #[default]
    #[serde(rename = "")]
    Unknown,
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
}

impl WorkflowPhase {
    pub fn completed(&self) -> bool {
        matches!(
            self,
            WorkflowPhase::Succeeded | WorkflowPhase::Failed | WorkflowPhase::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Unknown => "",
            WorkflowPhase::Pending => "Pending",
            WorkflowPhase::Running => "Running",
            WorkflowPhase::Succeeded => "Succeeded",
            WorkflowPhase::Failed => "Failed",
            WorkflowPhase::Error => "Error",
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<NodePhase> for WorkflowPhase {
    fn from(phase: NodePhase) -> Self {
        match phase {
            NodePhase::Pending => WorkflowPhase::Pending,
            NodePhase::Running => WorkflowPhase::Running,
            NodePhase::Succeeded | NodePhase::Skipped => WorkflowPhase::Succeeded,
            NodePhase::Failed => WorkflowPhase::Failed,
            NodePhase::Error => WorkflowPhase::Error,
        }
    }
}

/// When completed pods are deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodGcStrategy {
    #[default]
    #[serde(alias = "")]
    OnPodNone,
    OnPodCompletion,
    OnPodSuccess,
    OnWorkflowCompletion,
    OnWorkflowSuccess,
}

impl PodGcStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodGcStrategy::OnPodNone => "OnPodNone",
            PodGcStrategy::OnPodCompletion => "OnPodCompletion",
            PodGcStrategy::OnPodSuccess => "OnPodSuccess",
            PodGcStrategy::OnWorkflowCompletion => "OnWorkflowCompletion",
            PodGcStrategy::OnWorkflowSuccess => "OnWorkflowSuccess",
        }
    }
}

impl std::fmt::Display for PodGcStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PodGcStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "OnPodNone" => Ok(PodGcStrategy::OnPodNone),
            "OnPodCompletion" => Ok(PodGcStrategy::OnPodCompletion),
            "OnPodSuccess" => Ok(PodGcStrategy::OnPodSuccess),
            "OnWorkflowCompletion" => Ok(PodGcStrategy::OnWorkflowCompletion),
            "OnWorkflowSuccess" => Ok(PodGcStrategy::OnWorkflowSuccess),
            other => Err(format!("unknown pod GC strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodGc {
    #[serde(default)]
    pub strategy: PodGcStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,

    /// Delay before a completed pod is deleted, e.g. `30s`
    #[serde(default, deserialize_with = "opt_any_string", skip_serializing_if = "Option::is_none")]
    pub delete_delay_duration: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_after_completion: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_after_success: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_after_failure: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownStrategy {
    /// Stop everything, including exit handlers
    Terminate,
    /// Stop the main graph but still run exit handlers
    Stop,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemaphoreRef {
    /// Lock name; combined with the namespace into `namespace/name`
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Synchronization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semaphore: Option<SemaphoreRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutex: Option<SemaphoreRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplateRef {
    pub name: String,

    #[serde(default)]
    pub cluster_scope: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    #[serde(default)]
    pub templates: Vec<Template>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entrypoint: String,

    #[serde(default)]
    pub arguments: Arguments,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    #[serde(rename = "podGC", default, skip_serializing_if = "Option::is_none")]
    pub pod_gc: Option<PodGc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_strategy: Option<TtlStrategy>,

    /// Template run once the main graph is fulfilled
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub on_exit: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<ShutdownStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    /// Maximum pods running at once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization: Option<Synchronization>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_template_ref: Option<WorkflowTemplateRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_logs: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_spec_grace_period_seconds: Option<i64>,
}

impl WorkflowSpec {
    pub fn template(&self, name: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.name == name)
    }

    pub fn pod_gc_strategy(&self) -> PodGcStrategy {
        self.pod_gc.as_ref().map(|gc| gc.strategy).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,

    #[serde(default)]
    pub status: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default)]
    pub phase: WorkflowPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Nodes::is_empty")]
    pub nodes: Nodes,

    /// Version of the offloaded node map, when offloaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offload_node_status_version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<i64>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,

    /// Node ID to whether its task result reported every output
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub task_results_completion_status: BTreeMap<String, bool>,

    /// Global parameters exported by nodes through `globalName`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub global_parameters: BTreeMap<String, String>,
}

impl WorkflowStatus {
    pub fn is_offloaded(&self) -> bool {
        self.offload_node_status_version.is_some()
    }

    /// Set or replace a condition of the given type
    pub fn set_condition(&mut self, condition_type: &str, status: &str, message: &str) {
        let condition = Condition {
            condition_type: condition_type.to_string(),
            status: status.to_string(),
            message: message.to_string(),
        };
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    #[serde(default = "crate::api_version")]
    pub api_version: String,

    #[serde(default = "workflow_kind")]
    pub kind: String,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: WorkflowSpec,

    #[serde(default)]
    pub status: WorkflowStatus,
}

fn workflow_kind() -> String {
    Workflow::KIND.to_string()
}

impl Workflow {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    pub fn completed(&self) -> bool {
        self.status.phase.completed()
    }

    /// Whether the controller has finished and labelled the workflow
    pub fn labelled_completed(&self) -> bool {
        self.metadata.label(crate::common::LABEL_KEY_COMPLETED) == Some("true")
    }
}

impl Resource for Workflow {
    const KIND: &'static str = "Workflow";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Reusable workflow spec; also used for the cluster-scoped variant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    #[serde(default = "crate::api_version")]
    pub api_version: String,

    #[serde(default = "workflow_template_kind")]
    pub kind: String,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: WorkflowSpec,
}

fn workflow_template_kind() -> String {
    WorkflowTemplate::KIND.to_string()
}

impl WorkflowTemplate {
    pub fn is_cluster_scoped(&self) -> bool {
        self.kind == "ClusterWorkflowTemplate"
    }
}

impl Resource for WorkflowTemplate {
    const KIND: &'static str = "WorkflowTemplate";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// How many completed workflows of each class are kept
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Cap on Succeeded workflows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errored: Option<usize>,
}

impl RetentionPolicy {
    /// Cap for the class of a completed workflow phase
    pub fn cap(&self, phase: WorkflowPhase) -> Option<usize> {
        match phase {
            WorkflowPhase::Succeeded => self.completed,
            WorkflowPhase::Failed => self.failed,
            WorkflowPhase::Error => self.errored,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_parse() {
        let wf: Workflow = serde_json::from_str(
            r#"{
                "metadata":{"name":"hello","namespace":"argo"},
                "spec":{
                    "entrypoint":"main",
                    "podGC":{"strategy":"OnWorkflowCompletion","deleteDelayDuration":"30s"},
                    "templates":[{"name":"main","container":{"image":"busybox"}}]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(wf.api_version, "argoproj.io/v1alpha1");
        assert_eq!(wf.spec.pod_gc_strategy(), PodGcStrategy::OnWorkflowCompletion);
        assert!(wf.spec.template("main").is_some());
        assert_eq!(wf.status.phase, WorkflowPhase::Unknown);
    }

    #[test]
    fn test_empty_strategy_is_none() {
        let gc: PodGc = serde_json::from_str(r#"{"strategy":""}"#).unwrap();
        assert_eq!(gc.strategy, PodGcStrategy::OnPodNone);
    }

    #[test]
    fn test_retention_cap() {
        let policy = RetentionPolicy {
            completed: Some(10),
            failed: Some(2),
            errored: None,
        };
        assert_eq!(policy.cap(WorkflowPhase::Failed), Some(2));
        assert_eq!(policy.cap(WorkflowPhase::Error), None);
        assert_eq!(policy.cap(WorkflowPhase::Running), None);
    }
}
