//! Templates and the task/step graph types that reference them

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::{Artifact, ArtifactLocation};
use crate::de::{any_string, opt_any_string};
use crate::meta::{ConfigMapKeySelector, SecretKeySelector};
use crate::pod::{Container, Volume, VolumeMount};

/// A named input or output value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,

    #[serde(default, deserialize_with = "opt_any_string", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, deserialize_with = "opt_any_string", skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub global_name: String,

    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Parameter {
    pub fn with_value(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }
}

/// Source of an output parameter value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueFrom {
    /// File inside the main container
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(default, deserialize_with = "opt_any_string", skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expression: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub json_path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jq_filter: String,

    /// Reference to another parameter, `{{steps.x.outputs.parameters.y}}`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,

    /// Value supplied later by an external update of a suspend node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplied: Option<SuppliedValueFrom>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<ConfigMapKeySelector>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuppliedValueFrom {}

/// Parameters and artifacts a template accepts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inputs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl Inputs {
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.artifacts.is_empty()
    }
}

/// Values a template produces
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outputs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,

    /// Standard output of a script template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<String>,
}

impl Outputs {
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
            && self.artifacts.is_empty()
            && self.result.is_none()
            && self.exit_code.is_none()
    }

    /// Whether any output must be saved by the wait container
    pub fn has_outputs(&self) -> bool {
        !self.parameters.is_empty() || !self.artifacts.is_empty()
    }
}

/// Arguments passed to a template or a workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Arguments {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl Arguments {
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }
}

/// Extra metadata stamped on the pod of a template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Which failures a step or task tolerates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinueOn {
    #[serde(default)]
    pub error: bool,

    #[serde(default)]
    pub failed: bool,
}

/// Numeric fan-out, either `count` or `start`..`end`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    #[serde(default, deserialize_with = "opt_any_string", skip_serializing_if = "Option::is_none")]
    pub count: Option<String>,

    #[serde(default, deserialize_with = "opt_any_string", skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    #[serde(default, deserialize_with = "opt_any_string", skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,

    /// printf-style format, only `%d`, `%0Nd` and `%x` style verbs
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,
}

/// One step of a steps template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<Box<Template>>,

    #[serde(default)]
    pub arguments: Arguments,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub when: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub with_items: Vec<Value>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub with_param: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_sequence: Option<Sequence>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on: Option<ContinueOn>,
}

/// One task of a DAG template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagTask {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<Box<Template>>,

    #[serde(default)]
    pub arguments: Arguments,

    /// Legacy dependency list, implicitly `&&`-joined
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Boolean dependency expression
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub depends: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub when: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub with_items: Vec<Value>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub with_param: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_sequence: Option<Sequence>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on: Option<ContinueOn>,
}

impl DagTask {
    /// Whether the task fans out over items, a parameter list or a sequence
    pub fn is_expanded(&self) -> bool {
        !self.with_items.is_empty() || !self.with_param.is_empty() || self.with_sequence.is_some()
    }
}

impl WorkflowStep {
    pub fn is_expanded(&self) -> bool {
        !self.with_items.is_empty() || !self.with_param.is_empty() || self.with_sequence.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagTemplate {
    /// Space separated target task names; defaults to every leaf task
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,

    #[serde(default)]
    pub tasks: Vec<DagTask>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
}

impl DagTemplate {
    pub fn task(&self, name: &str) -> Option<&DagTask> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

/// Container with an inline script
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptTemplate {
    #[serde(flatten)]
    pub container: Container,

    #[serde(default)]
    pub source: String,
}

/// Create, apply, patch or delete an arbitrary resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    pub action: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub manifest: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub merge_strategy: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub success_condition: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_condition: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub set_owner_reference: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeader {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<HttpHeaderSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeaderSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeySelector>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpBodySource {
    /// Raw body bytes, base64 encoded on the wire
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bytes: String,
}

/// HTTP request performed by the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTemplate {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,

    pub url: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HttpHeader>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub success_condition: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_from: Option<HttpBodySource>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_verify: bool,
}

/// Source of a data template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_paths: Option<ArtifactPaths>,
}

/// Lists the keys below an artifact location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    #[serde(flatten)]
    pub artifact: Artifact,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformationStep {
    pub expression: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTemplate {
    pub source: DataSource,

    #[serde(default)]
    pub transformation: Vec<TransformationStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuspendTemplate {
    /// Resume automatically after this duration (`30s`, `5m`, bare seconds)
    #[serde(default, deserialize_with = "opt_any_string", skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

/// Container of a container set, with its start dependencies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerNode {
    #[serde(flatten)]
    pub container: Container,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSetRetryStrategy {
    #[serde(default, deserialize_with = "opt_any_string", skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    #[serde(default, deserialize_with = "any_string")]
    pub retries: String,
}

/// Several containers in one pod, ordered by dependencies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSetTemplate {
    #[serde(default)]
    pub containers: Vec<ContainerNode>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<ContainerSetRetryStrategy>,
}

impl ContainerSetTemplate {
    pub fn container(&self, name: &str) -> Option<&ContainerNode> {
        self.containers.iter().find(|c| c.container.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    Always,
    #[default]
    OnFailure,
    OnError,
    OnTransientError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(default, deserialize_with = "opt_any_string", skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<f64>,

    #[serde(default, deserialize_with = "opt_any_string", skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    /// Maximum number of retries; may be a template tag
    #[serde(default, deserialize_with = "opt_any_string", skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

/// Template variants; exactly one is set on a valid template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateType {
    Container,
    Script,
    Resource,
    Http,
    Data,
    Steps,
    Dag,
    Suspend,
    ContainerSet,
}

impl std::fmt::Display for TemplateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TemplateType::Container => "container",
            TemplateType::Script => "script",
            TemplateType::Resource => "resource",
            TemplateType::Http => "http",
            TemplateType::Data => "data",
            TemplateType::Steps => "steps",
            TemplateType::Dag => "dag",
            TemplateType::Suspend => "suspend",
            TemplateType::ContainerSet => "containerSet",
        };
        f.write_str(name)
    }
}

/// A reusable unit of work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Inputs::is_empty")]
    pub inputs: Inputs,

    #[serde(default, skip_serializing_if = "Outputs::is_empty")]
    pub outputs: Outputs,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataTemplate>,

    /// Ordered groups of parallel steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Vec<WorkflowStep>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag: Option<DagTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<SuspendTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_set: Option<ContainerSetTemplate>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<Container>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_location: Option<ArtifactLocation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Tee stdout of a plain container into `result`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_script_output: bool,

    /// Plugin names this template's pod needs sidecars for
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_plugins: Vec<String>,
}

impl Template {
    /// The single populated variant
    pub fn template_type(&self) -> Result<TemplateType, String> {
        let mut types = Vec::new();
        if self.container.is_some() {
            types.push(TemplateType::Container);
        }
        if self.script.is_some() {
            types.push(TemplateType::Script);
        }
        if self.resource.is_some() {
            types.push(TemplateType::Resource);
        }
        if self.http.is_some() {
            types.push(TemplateType::Http);
        }
        if self.data.is_some() {
            types.push(TemplateType::Data);
        }
        if self.steps.is_some() {
            types.push(TemplateType::Steps);
        }
        if self.dag.is_some() {
            types.push(TemplateType::Dag);
        }
        if self.suspend.is_some() {
            types.push(TemplateType::Suspend);
        }
        if self.container_set.is_some() {
            types.push(TemplateType::ContainerSet);
        }
        match types.as_slice() {
            [only] => Ok(*only),
            [] => Err(format!("template '{}' type is unspecified", self.name)),
            many => Err(format!(
                "template '{}' has multiple template types specified: {}",
                self.name,
                many.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
            )),
        }
    }

    /// Whether the template runs inside a pod the controller creates
    pub fn is_pod_type(&self) -> bool {
        matches!(
            self.template_type(),
            Ok(TemplateType::Container
                | TemplateType::Script
                | TemplateType::Resource
                | TemplateType::Data
                | TemplateType::ContainerSet)
        )
    }

    /// Whether the template has no child nodes
    pub fn is_leaf(&self) -> bool {
        !matches!(self.template_type(), Ok(TemplateType::Steps | TemplateType::Dag))
    }

    /// The user containers of the pod, in declaration order
    pub fn main_containers(&self) -> Vec<&Container> {
        if let Some(container) = &self.container {
            return vec![container];
        }
        if let Some(script) = &self.script {
            return vec![&script.container];
        }
        if let Some(set) = &self.container_set {
            return set.containers.iter().map(|c| &c.container).collect();
        }
        Vec::new()
    }

    /// Names of the user containers; single-container templates use `main`
    pub fn main_container_names(&self) -> Vec<String> {
        if let Some(set) = &self.container_set {
            return set.containers.iter().map(|c| c.container.name.clone()).collect();
        }
        vec![crate::common::MAIN_CONTAINER_NAME.to_string()]
    }

    /// Whether stdout of the main container becomes the `result` output
    pub fn captures_result(&self) -> bool {
        self.script.is_some() || self.include_script_output
    }

    pub fn volume_mounts(&self) -> Vec<&VolumeMount> {
        let mut mounts: Vec<&VolumeMount> = self
            .main_containers()
            .into_iter()
            .flat_map(|c| c.volume_mounts.iter())
            .collect();
        if let Some(set) = &self.container_set {
            mounts.extend(set.volume_mounts.iter());
        }
        mounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_type() {
        let template: Template = serde_json::from_str(
            r#"{"name":"whalesay","container":{"image":"docker/whalesay","command":["cowsay"]}}"#,
        )
        .unwrap();
        assert_eq!(template.template_type().unwrap(), TemplateType::Container);
        assert!(template.is_pod_type());
        assert!(template.is_leaf());

        let empty = Template {
            name: "empty".to_string(),
            ..Default::default()
        };
        assert!(empty.template_type().is_err());
    }

    #[test]
    fn test_multiple_types_rejected() {
        let template: Template = serde_json::from_str(
            r#"{"name":"x","container":{"image":"a"},"suspend":{}}"#,
        )
        .unwrap();
        let err = template.template_type().unwrap_err();
        assert!(err.contains("multiple"));
    }

    #[test]
    fn test_parameter_value_accepts_numbers() {
        let param: Parameter = serde_json::from_str(r#"{"name":"count","value":3}"#).unwrap();
        assert_eq!(param.value.as_deref(), Some("3"));
        let param: Parameter = serde_json::from_str(r#"{"name":"flag","value":true}"#).unwrap();
        assert_eq!(param.value.as_deref(), Some("true"));
    }

    #[test]
    fn test_steps_and_dag_parse() {
        let template: Template = serde_json::from_str(
            r#"{
                "name":"main",
                "dag":{"tasks":[
                    {"name":"A","template":"echo"},
                    {"name":"B","template":"echo","depends":"A"},
                    {"name":"C","template":"echo","dependencies":["A"],"withItems":[1,"two",{"k":"v"}]}
                ]}
            }"#,
        )
        .unwrap();
        let dag = template.dag.as_ref().unwrap();
        assert_eq!(dag.tasks.len(), 3);
        assert!(dag.task("C").unwrap().is_expanded());
        assert!(!template.is_leaf());
    }
}
