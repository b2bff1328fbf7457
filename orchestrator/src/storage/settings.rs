//! Controller configuration file

use std::path::Path;

use serde::{Deserialize, Serialize};
use workflow_api::{ArtifactLocation, RetentionPolicy};

use crate::errors::WfError;
use crate::filesys::file::File;
use crate::logs::{LogFormat, LogLevel};

/// Controller settings, read from `config.yaml` or JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Only workflows labelled with this instance ID are reconciled
    #[serde(default, rename = "instanceID")]
    pub instance_id: String,

    /// Namespace to watch; empty watches all namespaces
    #[serde(default)]
    pub namespace: String,

    /// Workflow reconcile workers
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    #[serde(default = "default_pod_cleanup_workers")]
    pub pod_cleanup_workers: usize,

    #[serde(default)]
    pub retention_policy: Option<RetentionPolicy>,

    #[serde(default)]
    pub node_status_offload: NodeStatusOffloadSettings,

    #[serde(default)]
    pub archive: ArchiveSettings,

    #[serde(default = "default_executor_image")]
    pub executor_image: String,

    /// Grace period passed when deleting pods
    #[serde(default)]
    pub pod_gc_grace_period_seconds: Option<i64>,

    /// Delay before an orphaned pod is deleted
    #[serde(default = "default_pod_gc_delete_delay_duration")]
    pub pod_gc_delete_delay_duration: String,

    /// Keep pods until their status is captured
    #[serde(default)]
    pub pod_status_capture_finalizer: bool,

    /// Accepted for compatibility, not merged into workflows
    #[serde(default)]
    pub workflow_defaults: Option<serde_json::Value>,

    /// Location used for output artifacts that only declare a key
    #[serde(default)]
    pub artifact_repository: Option<ArtifactLocation>,

    /// Artifact plugin sidecars, by plugin name
    #[serde(default)]
    pub artifact_plugins: Vec<ArtifactPluginSettings>,

    #[serde(default)]
    pub cluster: ClusterSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub webhook: WebhookSettings,
}

fn default_true() -> bool {
    true
}

fn default_parallelism() -> usize {
    32
}

fn default_pod_cleanup_workers() -> usize {
    4
}

fn default_executor_image() -> String {
    "quay.io/argoproj/argoexec:latest".to_string()
}

fn default_pod_gc_delete_delay_duration() -> String {
    "5s".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_format: LogFormat::Text,
            instance_id: String::new(),
            namespace: String::new(),
            parallelism: default_parallelism(),
            pod_cleanup_workers: default_pod_cleanup_workers(),
            retention_policy: None,
            node_status_offload: NodeStatusOffloadSettings::default(),
            archive: ArchiveSettings::default(),
            executor_image: default_executor_image(),
            pod_gc_grace_period_seconds: None,
            pod_gc_delete_delay_duration: default_pod_gc_delete_delay_duration(),
            pod_status_capture_finalizer: false,
            workflow_defaults: None,
            artifact_repository: None,
            artifact_plugins: Vec::new(),
            cluster: ClusterSettings::default(),
            server: ServerSettings::default(),
            webhook: WebhookSettings::default(),
        }
    }
}

impl Settings {
    /// Read settings from a YAML or JSON file
    pub async fn load(path: &Path) -> Result<Self, WfError> {
        let contents = File::new(path).read_string().await?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, WfError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(workflow_api::yaml::parse_one(contents)?)
    }
}

/// Offloading of large node maps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusOffloadSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Serialized size above which the node map is offloaded
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Directory of the volume-backed offload store
    #[serde(default = "default_offload_dir")]
    pub dir: String,
}

fn default_max_size() -> usize {
    1024 * 1024
}

fn default_offload_dir() -> String {
    "/var/lib/argoflow/offload".to_string()
}

impl Default for NodeStatusOffloadSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: default_max_size(),
            dir: default_offload_dir(),
        }
    }
}

/// Archiving of completed workflows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Age after which archived workflows are deleted, e.g. `7d` as `168h`
    #[serde(default)]
    pub ttl: Option<String>,

    #[serde(default = "default_archive_dir")]
    pub dir: String,
}

fn default_archive_dir() -> String {
    "/var/lib/argoflow/archive".to_string()
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: None,
            dir: default_archive_dir(),
        }
    }
}

/// Connection to the cluster API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSettings {
    #[serde(default = "default_api_server")]
    pub api_server: String,

    #[serde(default = "default_token_file")]
    pub token_file: String,

    #[serde(default)]
    pub insecure: bool,

    /// Cluster name used as the offload and archive key prefix
    #[serde(default = "default_cluster_name")]
    pub name: String,
}

fn default_api_server() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_token_file() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}

fn default_cluster_name() -> String {
    "default".to_string()
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            api_server: default_api_server(),
            token_file: default_token_file(),
            insecure: false,
            name: default_cluster_name(),
        }
    }
}

/// Webhook ingress server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    2746
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Image and command of one artifact plugin sidecar
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactPluginSettings {
    pub name: String,

    pub image: String,

    /// Plugin server command; it must listen on the plugin socket
    #[serde(default)]
    pub command: Vec<String>,
}

/// Webhook clients, keyed by the service account whose token they receive
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSettings {
    #[serde(default)]
    pub clients: std::collections::BTreeMap<String, WebhookClient>,
}

/// How one webhook source proves its identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookClient {
    /// `github`, `gitlab`, `bitbucket` or `generic`
    #[serde(rename = "type")]
    pub client_type: String,

    pub secret: String,

    /// Signature header for generic clients
    #[serde(default)]
    pub header: String,

    /// `sha1` or `sha256` for generic clients
    #[serde(default)]
    pub algorithm: String,

    /// `hex` or `base64` for generic clients
    #[serde(default)]
    pub encoding: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings.parallelism, 32);
        assert_eq!(settings.pod_cleanup_workers, 4);
        assert_eq!(settings.node_status_offload.max_size, 1024 * 1024);
        assert_eq!(settings.pod_gc_delete_delay_duration, "5s");
    }

    #[test]
    fn test_parse_yaml() {
        let settings = Settings::parse(
            r#"
instanceID: blue
parallelism: 8
retentionPolicy:
  completed: 10
  failed: 3
nodeStatusOffload:
  enabled: true
artifactRepository:
  volume:
    name: artifacts
artifactPlugins:
  - name: minio
    image: example/minio-plugin:v1
webhook:
  clients:
    github-sa:
      type: github
      secret: shh
"#,
        )
        .unwrap();
        assert_eq!(settings.instance_id, "blue");
        assert_eq!(settings.parallelism, 8);
        assert_eq!(settings.retention_policy.unwrap().failed, Some(3));
        assert!(settings.node_status_offload.enabled);
        assert!(settings.artifact_repository.unwrap().volume.is_some());
        assert_eq!(settings.artifact_plugins[0].image, "example/minio-plugin:v1");
        assert_eq!(settings.webhook.clients["github-sa"].client_type, "github");
    }
}
