//! Typed lookup of environment variables

use std::time::Duration;

use tracing::warn;
use workflow_api::common::*;

use crate::utils::parse_duration;

/// Duration from `name`, falling back to `default` when unset or malformed
pub fn env_duration(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => match parse_duration(&value) {
            Ok(duration) => duration,
            Err(e) => {
                warn!("ignoring invalid {}={}: {}", name, value, e);
                default
            }
        },
        _ => default,
    }
}

/// Boolean from `name`; accepts `true/false/1/0/yes/no`
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            "" => default,
            other => {
                warn!("ignoring invalid {}={}", name, other);
                default
            }
        },
        Err(_) => default,
    }
}

pub fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Controller tunables read from the environment
#[derive(Debug, Clone)]
pub struct ControllerEnv {
    pub offload_node_status_ttl: Duration,
    pub archived_workflow_gc_period: Duration,
    pub retention_gc_period: Duration,
    pub workflow_gc_period: Duration,
    pub resource_state_check_interval: Duration,
    pub index_workflow_semaphore_keys: bool,
    pub all_pod_changes_significant: bool,
    pub expression_templates: bool,
}

impl Default for ControllerEnv {
    fn default() -> Self {
        Self {
            offload_node_status_ttl: Duration::from_secs(5 * 60),
            archived_workflow_gc_period: Duration::from_secs(24 * 3600),
            retention_gc_period: Duration::from_secs(60),
            workflow_gc_period: Duration::from_secs(5 * 60),
            resource_state_check_interval: Duration::from_secs(5),
            index_workflow_semaphore_keys: true,
            all_pod_changes_significant: false,
            expression_templates: true,
        }
    }
}

impl ControllerEnv {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            offload_node_status_ttl: env_duration(
                ENV_VAR_OFFLOAD_NODE_STATUS_TTL,
                defaults.offload_node_status_ttl,
            ),
            archived_workflow_gc_period: env_duration(
                ENV_VAR_ARCHIVED_WORKFLOW_GC_PERIOD,
                defaults.archived_workflow_gc_period,
            ),
            retention_gc_period: env_duration(ENV_VAR_RETENTION_GC_PERIOD, defaults.retention_gc_period),
            workflow_gc_period: env_duration(ENV_VAR_WORKFLOW_GC_PERIOD, defaults.workflow_gc_period),
            resource_state_check_interval: env_duration(
                ENV_VAR_RESOURCE_STATE_CHECK_INTERVAL,
                defaults.resource_state_check_interval,
            ),
            index_workflow_semaphore_keys: env_bool(
                ENV_VAR_INDEX_WORKFLOW_SEMAPHORE_KEYS,
                defaults.index_workflow_semaphore_keys,
            ),
            all_pod_changes_significant: env_bool(
                ENV_VAR_ALL_POD_CHANGES_SIGNIFICANT,
                defaults.all_pod_changes_significant,
            ),
            expression_templates: env_bool(ENV_VAR_EXPRESSION_TEMPLATES, defaults.expression_templates),
        }
    }
}

/// Identity and switches of an executor process
#[derive(Debug, Clone, Default)]
pub struct ExecutorEnv {
    pub container_name: String,
    pub include_script_output: bool,
    pub template: Option<String>,
    pub pod_name: String,
    pub pod_uid: String,
    pub namespace: String,
    pub host_ip: String,
    pub pod_ip: String,
    pub node_id: String,
    pub workflow_name: String,
    pub workflow_uid: String,
    pub deadline: Option<String>,
    pub progress_file: Option<String>,
    pub termination_grace_period: Duration,
    pub artifact_plugin_names: Vec<String>,
    pub debug_pause_before: bool,
    pub debug_pause_after: bool,
    pub default_artifact_repository: Option<String>,
    pub resource_state_check_interval: Duration,
}

impl ExecutorEnv {
    pub fn from_env() -> Self {
        let optional = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            container_name: env_string(ENV_VAR_CONTAINER_NAME, MAIN_CONTAINER_NAME),
            include_script_output: env_bool(ENV_VAR_INCLUDE_SCRIPT_OUTPUT, false),
            template: optional(ENV_VAR_TEMPLATE),
            pod_name: env_string(ENV_VAR_POD_NAME, ""),
            pod_uid: env_string(ENV_VAR_POD_UID, ""),
            namespace: env_string(ENV_VAR_NAMESPACE, "default"),
            host_ip: env_string(ENV_VAR_HOST_IP, ""),
            pod_ip: env_string(ENV_VAR_POD_IP, ""),
            node_id: env_string(ENV_VAR_NODE_ID, ""),
            workflow_name: env_string(ENV_VAR_WORKFLOW_NAME, ""),
            workflow_uid: env_string(ENV_VAR_WORKFLOW_UID, ""),
            deadline: optional(ENV_VAR_DEADLINE),
            progress_file: optional(ENV_VAR_PROGRESS_FILE),
            termination_grace_period: env_duration(
                ENV_VAR_TERMINATION_GRACE_PERIOD,
                Duration::from_secs(30),
            ),
            artifact_plugin_names: optional(ENV_VAR_ARTIFACT_PLUGIN_NAMES)
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            debug_pause_before: env_bool(ENV_VAR_DEBUG_PAUSE_BEFORE, false),
            debug_pause_after: env_bool(ENV_VAR_DEBUG_PAUSE_AFTER, false),
            default_artifact_repository: optional(ENV_VAR_DEFAULT_ARTIFACT_REPOSITORY),
            resource_state_check_interval: env_duration(
                ENV_VAR_RESOURCE_STATE_CHECK_INTERVAL,
                Duration::from_secs(5),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_duration_fallbacks() {
        std::env::set_var("ARGOFLOW_TEST_DURATION_OK", "1m30s");
        std::env::set_var("ARGOFLOW_TEST_DURATION_BAD", "soon");
        assert_eq!(
            env_duration("ARGOFLOW_TEST_DURATION_OK", Duration::from_secs(1)),
            Duration::from_secs(90)
        );
        assert_eq!(
            env_duration("ARGOFLOW_TEST_DURATION_BAD", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
        assert_eq!(
            env_duration("ARGOFLOW_TEST_DURATION_UNSET", Duration::from_secs(7)),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_env_bool() {
        std::env::set_var("ARGOFLOW_TEST_BOOL", "false");
        assert!(!env_bool("ARGOFLOW_TEST_BOOL", true));
        assert!(env_bool("ARGOFLOW_TEST_BOOL_UNSET", true));
    }

    #[test]
    fn test_controller_defaults() {
        let env = ControllerEnv::default();
        assert_eq!(env.retention_gc_period, Duration::from_secs(60));
        assert_eq!(env.archived_workflow_gc_period, Duration::from_secs(86400));
        assert!(env.expression_templates);
    }
}
