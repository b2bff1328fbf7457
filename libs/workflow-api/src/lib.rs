//! Workflow API models
//!
//! Serde models of the `argoproj.io/v1alpha1` custom resources, the subset of
//! the core Pod API the controllers read, and the well-known label, annotation
//! and environment names shared by the controller and the executor.

pub mod artifact;
pub mod common;
mod de;
pub mod meta;
pub mod node;
pub mod pod;
pub mod task;
pub mod template;
pub mod workflow;
pub mod yaml;

pub use artifact::{
    ArchiveStrategy, Artifact, ArtifactLocation, ArtifactoryArtifact, GitArtifact, HdfsArtifact,
    HttpArtifact, PluginArtifact, RawArtifact, VolumeArtifact,
};
pub use meta::{ObjectMeta, OwnerReference, Resource};
pub use node::{NodePhase, NodeResult, NodeStatus, NodeType, Nodes};
pub use pod::{Pod, PodPhase};
pub use task::{WorkflowTaskResult, WorkflowTaskSet};
pub use template::{
    Arguments, Backoff, ContinueOn, DagTask, DagTemplate, Inputs, Outputs, Parameter, RetryPolicy,
    RetryStrategy, Sequence, Template, TemplateType, ValueFrom, WorkflowStep,
};
pub use workflow::{
    PodGcStrategy, RetentionPolicy, Workflow, WorkflowPhase, WorkflowSpec, WorkflowStatus,
    WorkflowTemplate,
};

/// API group of the workflow resources
pub const GROUP: &str = "argoproj.io";

/// API version of the workflow resources
pub const VERSION: &str = "v1alpha1";

/// `apiVersion` value carried by every workflow resource
pub fn api_version() -> String {
    format!("{}/{}", GROUP, VERSION)
}
