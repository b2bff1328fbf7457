//! Well-known labels, annotations, finalizers, paths and environment variables

/// Label naming the workflow a pod or task result belongs to
pub const LABEL_KEY_WORKFLOW: &str = "workflows.argoproj.io/workflow";

/// Label marking a pod (or workflow) as completed and processed
pub const LABEL_KEY_COMPLETED: &str = "workflows.argoproj.io/completed";

/// Label carrying the workflow phase
pub const LABEL_KEY_PHASE: &str = "workflows.argoproj.io/phase";

/// Label carrying the controller instance ID
pub const LABEL_KEY_CONTROLLER_INSTANCE_ID: &str = "workflows.argoproj.io/controller-instanceid";

/// Label set on task results once every output has been reported
pub const LABEL_KEY_REPORT_OUTPUTS_COMPLETED: &str = "workflows.argoproj.io/report-outputs-completed";

/// Labels used to find a duration baseline for a new workflow
pub const LABEL_KEY_WORKFLOW_TEMPLATE: &str = "workflows.argoproj.io/workflow-template";
pub const LABEL_KEY_CLUSTER_WORKFLOW_TEMPLATE: &str = "workflows.argoproj.io/cluster-workflow-template";
pub const LABEL_KEY_CRON_WORKFLOW: &str = "workflows.argoproj.io/cron-workflow";

/// Annotation with the node display name of a pod
pub const ANNOTATION_KEY_NODE_NAME: &str = "workflows.argoproj.io/node-name";

/// Annotation with the node ID of a pod
pub const ANNOTATION_KEY_NODE_ID: &str = "workflows.argoproj.io/node-id";

/// Annotation with the JSON of the template a pod runs
pub const ANNOTATION_KEY_TEMPLATE: &str = "workflows.argoproj.io/template";

/// Annotation with `<strategy>[/<delay>]`
pub const ANNOTATION_KEY_POD_GC_STRATEGY: &str = "workflows.argoproj.io/pod-gc-strategy";

/// Annotation carrying self-reported progress
pub const ANNOTATION_KEY_PROGRESS: &str = "workflows.argoproj.io/progress";

/// Finalizer keeping a pod until its status was captured
pub const FINALIZER_POD_STATUS: &str = "workflows.argoproj.io/pod-status";

/// Name of the user container
pub const MAIN_CONTAINER_NAME: &str = "main";

/// Name of the executor sidecar that saves outputs
pub const WAIT_CONTAINER_NAME: &str = "wait";

/// Name of the init container that stages inputs
pub const INIT_CONTAINER_NAME: &str = "init";

/// Prefix of artifact plugin sidecar containers and volumes
pub const ARTIFACT_PLUGIN_PREFIX: &str = "artifact-plugin-";

/// Shared coordination directory of every container in a pod
pub const VAR_RUN_ARGO_PATH: &str = "/var/run/argo";

/// Mount point of the main container's root filesystem in the wait container
pub const MAIN_FILESYSTEM_DIR: &str = "/mainctrfs";

/// Directory input artifacts are loaded into before being moved
pub const EXECUTOR_ARTIFACT_BASE_DIR: &str = "/argo/inputs/artifacts";

/// Directory the script source is staged into
pub const EXECUTOR_STAGING_DIR: &str = "/argo/staging";

/// Script file name in the staging directory
pub const EXECUTOR_SCRIPT_SOURCE_NAME: &str = "script";

/// Manifest path for resource templates
pub const EXECUTOR_RESOURCE_MANIFEST_PATH: &str = "/tmp/manifest.yaml";

/// Directory artifact plugin sockets live under
pub const ARTIFACT_PLUGIN_SOCKET_DIR: &str = "/tmp/artifact-plugins";

/// Prefix of sentinel values used during mock substitution
pub const PLACEHOLDER_PREFIX: &str = "__argo__internal__placeholder";

// Executor environment

pub const ENV_VAR_CONTAINER_NAME: &str = "ARGO_CONTAINER_NAME";
pub const ENV_VAR_INCLUDE_SCRIPT_OUTPUT: &str = "ARGO_INCLUDE_SCRIPT_OUTPUT";
pub const ENV_VAR_TEMPLATE: &str = "ARGO_TEMPLATE";
pub const ENV_VAR_POD_NAME: &str = "ARGO_POD_NAME";
pub const ENV_VAR_POD_UID: &str = "ARGO_POD_UID";
pub const ENV_VAR_NAMESPACE: &str = "ARGO_NAMESPACE";
pub const ENV_VAR_HOST_IP: &str = "ARGO_HOST_IP";
pub const ENV_VAR_POD_IP: &str = "ARGO_POD_IP";
pub const ENV_VAR_NODE_ID: &str = "ARGO_NODE_ID";
pub const ENV_VAR_WORKFLOW_NAME: &str = "ARGO_WORKFLOW_NAME";
pub const ENV_VAR_WORKFLOW_UID: &str = "ARGO_WORKFLOW_UID";
pub const ENV_VAR_DEADLINE: &str = "ARGO_DEADLINE";
pub const ENV_VAR_PROGRESS_FILE: &str = "ARGO_PROGRESS_FILE";
pub const ENV_VAR_TERMINATION_GRACE_PERIOD: &str = "ARGO_TERMINATION_GRACE_PERIOD";
pub const ENV_VAR_ARTIFACT_PLUGIN_NAMES: &str = "ARGO_ARTIFACT_PLUGIN_NAMES";
pub const ENV_VAR_DEBUG_PAUSE_BEFORE: &str = "ARGO_DEBUG_PAUSE_BEFORE";
pub const ENV_VAR_DEBUG_PAUSE_AFTER: &str = "ARGO_DEBUG_PAUSE_AFTER";
pub const ENV_VAR_DEFAULT_ARTIFACT_REPOSITORY: &str = "ARGO_ARTIFACT_REPOSITORY";

// Controller environment

pub const ENV_VAR_OFFLOAD_NODE_STATUS_TTL: &str = "OFFLOAD_NODE_STATUS_TTL";
pub const ENV_VAR_ARCHIVED_WORKFLOW_GC_PERIOD: &str = "ARCHIVED_WORKFLOW_GC_PERIOD";
pub const ENV_VAR_RETENTION_GC_PERIOD: &str = "RETENTION_GC_PERIOD";
pub const ENV_VAR_WORKFLOW_GC_PERIOD: &str = "WORKFLOW_GC_PERIOD";
pub const ENV_VAR_RESOURCE_STATE_CHECK_INTERVAL: &str = "RESOURCE_STATE_CHECK_INTERVAL";
pub const ENV_VAR_INDEX_WORKFLOW_SEMAPHORE_KEYS: &str = "INDEX_WORKFLOW_SEMAPHORE_KEYS";
pub const ENV_VAR_ALL_POD_CHANGES_SIGNIFICANT: &str = "ALL_POD_CHANGES_SIGNIFICANT";
pub const ENV_VAR_EXPRESSION_TEMPLATES: &str = "EXPRESSION_TEMPLATES";

/// Whether a container name belongs to an artifact plugin sidecar
pub fn is_artifact_plugin_sidecar(container_name: &str) -> bool {
    container_name.starts_with(ARTIFACT_PLUGIN_PREFIX)
}

/// Directory holding the socket of an artifact plugin
pub fn artifact_plugin_socket_dir(plugin_name: &str) -> String {
    format!("{}/{}", ARTIFACT_PLUGIN_SOCKET_DIR, plugin_name)
}

/// Unix socket an artifact plugin listens on
pub fn artifact_plugin_socket_path(plugin_name: &str) -> String {
    format!("{}/socket", artifact_plugin_socket_dir(plugin_name))
}

/// Sidecar container (and volume) name of an artifact plugin
pub fn artifact_plugin_container_name(plugin_name: &str) -> String {
    format!("{}{}", ARTIFACT_PLUGIN_PREFIX, plugin_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_paths() {
        assert_eq!(artifact_plugin_socket_dir("my-plugin"), "/tmp/artifact-plugins/my-plugin");
        assert_eq!(
            artifact_plugin_socket_path("my-plugin"),
            "/tmp/artifact-plugins/my-plugin/socket"
        );
        assert_eq!(artifact_plugin_container_name("my-plugin"), "artifact-plugin-my-plugin");
        assert!(is_artifact_plugin_sidecar("artifact-plugin-my-plugin"));
        assert!(!is_artifact_plugin_sidecar("main"));
    }
}
