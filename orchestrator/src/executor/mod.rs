//! In-pod executor
//!
//! One binary plays every executor role of a workflow pod. The `init`
//! container stages inputs, `emissary` wraps the user command as PID 1 of
//! each main container, and `wait` saves outputs once the main containers
//! exit. The roles coordinate only through files under `/var/run/argo` (see
//! [`VarRunArgo`](crate::storage::layout::VarRunArgo)); results reach the
//! controller as a `WorkflowTaskResult`.

pub mod agent;
pub mod data;
pub mod deadline;
pub mod emissary;
pub mod init;
pub mod kill;
pub mod outputs;
pub mod plugin;
pub mod resource;
pub mod task_result;
pub mod wait;

use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};
use workflow_api::artifact::ArtifactLocation;
use workflow_api::template::TemplateType;
use workflow_api::Template;

use crate::app::options::ExecutorOptions;
use crate::artifacts::{DefaultDriverFactory, DriverFactory};
use crate::cache::ResourceCache;
use crate::cluster::{KubeRestClient, SharedClient};
use crate::errors::WfError;
use crate::storage::layout::is_under;
use crate::storage::settings::ClusterSettings;
use crate::telemetry::Tracer;

/// Executor state shared by the init, wait, resource and data roles
pub struct WorkflowExecutor {
    pub options: ExecutorOptions,
    pub template: Template,
    client: SharedClient,
    factory: Arc<dyn DriverFactory>,
    tracer: Tracer,
    errors: Mutex<Vec<String>>,
    default_repository: Option<ArtifactLocation>,
}

impl WorkflowExecutor {
    pub fn new(
        options: ExecutorOptions,
        template: Template,
        client: SharedClient,
        factory: Arc<dyn DriverFactory>,
    ) -> Self {
        let default_repository = options
            .env
            .default_artifact_repository
            .as_deref()
            .and_then(|raw| match serde_json::from_str::<ArtifactLocation>(raw) {
                Ok(location) => Some(location),
                Err(e) => {
                    warn!("ignoring invalid default artifact repository: {}", e);
                    None
                }
            });
        Self {
            options,
            template,
            client,
            factory,
            tracer: Tracer::new(),
            errors: Mutex::new(Vec::new()),
            default_repository,
        }
    }

    /// Repository used for output artifacts that only declare a path
    pub fn with_default_repository(mut self, location: Option<ArtifactLocation>) -> Self {
        self.default_repository = location;
        self
    }

    pub fn client(&self) -> &SharedClient {
        &self.client
    }

    pub fn factory(&self) -> &dyn DriverFactory {
        self.factory.as_ref()
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn default_repository(&self) -> Option<&ArtifactLocation> {
        self.default_repository.as_ref()
    }

    /// Remember an error; it ends up as the message of the task result
    pub fn record_error(&self, err: WfError) {
        self.record_message(err.to_string());
    }

    /// Remember a failure message verbatim
    pub fn record_message(&self, message: impl Into<String>) {
        let message = message.into();
        error!("executor error: {}", message);
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Every recorded error joined with `"; "`
    pub fn error_message(&self) -> String {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).join("; ")
    }

    /// Whether `path` lies on a volume the user mounted into a main container
    pub fn is_on_volume_mount(&self, path: &str) -> bool {
        self.template
            .volume_mounts()
            .iter()
            .any(|m| is_under(path, &m.mount_path))
    }

    /// Write the script source or resource manifest before main starts
    pub async fn stage_files(&self) -> Result<(), WfError> {
        match self.template.template_type().map_err(WfError::BadRequest)? {
            TemplateType::Script => {
                let source = self
                    .template
                    .script
                    .as_ref()
                    .map(|s| s.source.as_str())
                    .unwrap_or_default();
                let file = self.options.layout.script_file();
                file.write_string(source).await?;
                file.set_mode(0o755).await?;
                info!("staged script source to {:?}", file.path());
            }
            TemplateType::Resource => {
                let manifest = self
                    .template
                    .resource
                    .as_ref()
                    .map(|r| r.manifest.as_str())
                    .unwrap_or_default();
                let file = self.options.layout.manifest_file();
                file.write_string(manifest).await?;
                info!("staged resource manifest to {:?}", file.path());
            }
            _ => {}
        }
        Ok(())
    }
}

/// The running template: `ARGO_TEMPLATE` when set, else the shared template file
pub async fn load_template(options: &ExecutorOptions) -> Result<Template, WfError> {
    match &options.env.template {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| WfError::BadRequest(format!("invalid template in environment: {}", e))),
        None => options.var_run_argo.template_file().read_json().await,
    }
}

async fn build_executor(options: ExecutorOptions) -> Result<WorkflowExecutor, WfError> {
    let template = load_template(&options).await?;
    let client: SharedClient = Arc::new(KubeRestClient::from_settings(&ClusterSettings::default()).await?);
    let resources = Arc::new(ResourceCache::new(client.clone(), &options.env.namespace));
    let factory = DefaultDriverFactory::new(resources)
        .with_volume_root(options.volume_root.clone())
        .with_plugin_sockets(options.plugin_socket_dir.clone(), options.plugin_wait.clone());
    Ok(WorkflowExecutor::new(options, template, client, Arc::new(factory)))
}

/// Modes accepted by `exec`
pub const MODES: &[&str] = &[
    "init",
    "wait",
    "emissary",
    "agent",
    "artifact-plugin-init",
    "artifact-plugin-sidecar",
    "data",
    "resource",
    "kill",
];

/// Run one executor mode; returns the process exit code
pub async fn run_mode(mode: &str, args: &[String]) -> Result<i32, WfError> {
    let options = ExecutorOptions::from_env();
    info!(mode, pod = %options.env.pod_name, container = %options.env.container_name, "executor starting");
    match mode {
        "init" => {
            plugin::copy_executor_binary(&options.var_run_argo.executor_binary()).await?;
            let executor = build_executor(options).await?;
            executor.init().await?;
            Ok(0)
        }
        "wait" => {
            let executor = build_executor(options).await?;
            executor.wait().await?;
            Ok(0)
        }
        "emissary" => Ok(emissary::run(&options, args).await),
        "agent" => {
            let client: SharedClient =
                Arc::new(KubeRestClient::from_settings(&ClusterSettings::default()).await?);
            let agent = agent::AgentExecutor::new(client, &options.env.namespace, &options.env.workflow_name);
            agent
                .run(
                    options.dependency_poll_interval,
                    tokio::time::sleep,
                    Box::pin(crate::app::run::await_shutdown_signal()),
                )
                .await?;
            Ok(0)
        }
        "artifact-plugin-init" => {
            plugin::copy_executor_binary(&options.var_run_argo.executor_binary()).await?;
            Ok(0)
        }
        "artifact-plugin-sidecar" => plugin::run_sidecar(&options, args).await,
        "data" => {
            let executor = build_executor(options).await?;
            executor.execute_data().await?;
            Ok(0)
        }
        "resource" => {
            let executor = build_executor(options).await?;
            executor.execute_resource().await?;
            Ok(0)
        }
        "kill" => {
            kill::kill(args)?;
            Ok(0)
        }
        other => Err(WfError::BadRequest(format!(
            "unknown executor mode '{}', expected one of: {}",
            other,
            MODES.join(", ")
        ))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::artifacts::testing::StaticResources;
    use crate::cluster::InMemoryCluster;
    use crate::storage::layout::{ExecutorLayout, VarRunArgo};
    use std::path::Path;
    use std::time::Duration;

    /// Executor options rooted in a temp dir with fast poll intervals
    pub fn options(root: &Path) -> ExecutorOptions {
        let mut options = ExecutorOptions {
            var_run_argo: VarRunArgo::new(root.join("var/run/argo")),
            layout: ExecutorLayout::rooted(root),
            volume_root: root.join("mnt"),
            dependency_poll_interval: Duration::from_millis(20),
            signal_poll_interval: Duration::from_millis(20),
            progress_poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        options.env.container_name = "main".to_string();
        options.env.namespace = "argo".to_string();
        options.env.pod_name = "wf-123".to_string();
        options.env.node_id = "wf-123".to_string();
        options.env.workflow_name = "wf".to_string();
        options.env.workflow_uid = "uid-1".to_string();
        options.backoff.base_delay = Duration::from_millis(1);
        options
    }

    pub fn executor(root: &Path, template: Template, cluster: Arc<InMemoryCluster>) -> WorkflowExecutor {
        let options = options(root);
        let factory = DefaultDriverFactory::new(Arc::new(StaticResources::default()))
            .with_volume_root(options.volume_root.clone());
        WorkflowExecutor::new(options, template, cluster, Arc::new(factory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;

    #[tokio::test]
    async fn test_stage_script() {
        let tmp = tempfile::tempdir().unwrap();
        let template: Template =
            serde_json::from_str(r#"{"name":"s","script":{"image":"python","source":"print(1)"}}"#).unwrap();
        let executor = testing::executor(tmp.path(), template, Arc::new(InMemoryCluster::new()));
        executor.stage_files().await.unwrap();
        let staged = executor.options.layout.script_file();
        assert_eq!(staged.read_string().await.unwrap(), "print(1)");
    }

    #[tokio::test]
    async fn test_errors_are_joined() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = testing::executor(tmp.path(), Template::default(), Arc::new(InMemoryCluster::new()));
        assert!(!executor.has_errors());
        executor.record_error(WfError::NotFound("a".to_string()));
        executor.record_error(WfError::Internal("b".to_string()));
        assert_eq!(executor.error_message(), "not found: a; internal error: b");
    }

    #[tokio::test]
    async fn test_load_template_from_env_value() {
        let tmp = tempfile::tempdir().unwrap();
        let mut options = testing::options(tmp.path());
        options.env.template = Some(r#"{"name":"t","container":{"image":"busybox"}}"#.to_string());
        let template = load_template(&options).await.unwrap();
        assert_eq!(template.name, "t");

        options.env.template = None;
        assert!(load_template(&options).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_mode() {
        let err = run_mode("bogus", &[]).await.unwrap_err();
        assert!(err.to_string().contains("unknown executor mode"));
    }
}
