//! `wait` role: wait for the main containers, then report outputs

use tracing::{info, warn};
use workflow_api::common::{artifact_plugin_container_name, MAIN_CONTAINER_NAME};
use workflow_api::{NodeResult, Outputs};

use super::WorkflowExecutor;
use crate::errors::WfError;
use crate::telemetry::attributes::{ATTRIB_WORKFLOW_NAME, ATTRIB_WORKFLOW_NAMESPACE};
use crate::telemetry::spans::{RUN_WAIT_CONTAINER, WAIT_WORKLOAD};
use crate::telemetry::TraceSpan;

impl WorkflowExecutor {
    pub async fn wait(&self) -> Result<(), WfError> {
        let env = &self.options.env;
        let root = self.tracer().start(
            RUN_WAIT_CONTAINER,
            None,
            &[
                (ATTRIB_WORKFLOW_NAME, env.workflow_name.as_str()),
                (ATTRIB_WORKFLOW_NAMESPACE, env.namespace.as_str()),
            ],
        );

        let mut outputs = Outputs::default();
        match self.wait_with_monitors(&root).await {
            Ok(code) => outputs.exit_code = Some(code.to_string()),
            Err(e) => self.record_error(e),
        }

        // Outputs are collected even when waiting failed
        if let Err(e) = self.capture_script_result(&mut outputs).await {
            self.record_error(e);
        }
        self.save_parameters(&mut outputs).await;
        self.save_artifacts(&root, &mut outputs).await;
        self.save_logs(&mut outputs).await;

        let result = NodeResult {
            message: self.error_message(),
            outputs: (!outputs.is_empty()).then_some(outputs),
            ..Default::default()
        };
        if let Err(e) = self.report_result(&result, &root).await {
            self.record_error(e);
        }
        self.kill_sidecars().await;
        if let Err(e) = self.finalize_result(&root).await {
            self.record_error(e);
        }

        if self.has_errors() {
            return Err(WfError::Internal(self.error_message()));
        }
        info!("wait completed for node {}", env.node_id);
        Ok(())
    }

    async fn wait_with_monitors(&self, root: &TraceSpan) -> Result<i32, WfError> {
        let _span = self.tracer().start(WAIT_WORKLOAD, Some(root), &[]);
        tokio::select! {
            code = self.wait_workload() => code,
            _ = self.monitor_deadline() => Err(WfError::Internal("deadline monitor stopped".to_string())),
            _ = self.monitor_progress(root) => Err(WfError::Internal("progress monitor stopped".to_string())),
        }
    }

    /// Poll the exit code files of every main container
    ///
    /// Returns the first non-zero exit code in container order, else 0.
    pub async fn wait_workload(&self) -> Result<i32, WfError> {
        let containers = self.template.main_container_names();
        let mut codes = Vec::with_capacity(containers.len());
        for container in &containers {
            let file = self.options.var_run_argo.exitcode_file(container);
            let code = loop {
                if let Some(code) = file.read_int().await? {
                    break code;
                }
                tokio::time::sleep(self.options.dependency_poll_interval).await;
            };
            info!("container {} exited with code {}", container, code);
            codes.push(code);
        }
        Ok(codes.into_iter().find(|c| *c != 0).unwrap_or(0))
    }

    /// Ask sidecars and artifact plugin sidecars to stop
    pub async fn kill_sidecars(&self) {
        let mut names: Vec<String> = self.template.sidecars.iter().map(|c| c.name.clone()).collect();
        names.extend(self.artifact_plugin_sidecars());
        for name in names {
            if name == MAIN_CONTAINER_NAME {
                continue;
            }
            let file = self.options.var_run_argo.signal_file(&name);
            match file.write_string("15").await {
                Ok(()) => info!("signalled sidecar {} to terminate", name),
                Err(e) => warn!("failed to signal sidecar {}: {}", name, e),
            }
        }
    }

    fn artifact_plugin_sidecars(&self) -> Vec<String> {
        let mut plugins = self.options.env.artifact_plugin_names.clone();
        for name in &self.template.artifact_plugins {
            if !plugins.contains(name) {
                plugins.push(name.clone());
            }
        }
        plugins.iter().map(|p| artifact_plugin_container_name(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use crate::cluster::{Api, InMemoryCluster};
    use crate::filesys::archive::tar_gz;
    use crate::filesys::file::File;
    use std::sync::Arc;
    use workflow_api::{Template, WorkflowTaskResult};

    #[tokio::test]
    async fn test_wait_reports_outputs_and_signals_sidecars() {
        let tmp = tempfile::tempdir().unwrap();
        let cluster = Arc::new(InMemoryCluster::new());
        let template: Template = serde_json::from_str(
            r#"{"name":"s","script":{"image":"python","source":"print('hi')"},
                "sidecars":[{"name":"db","image":"redis"}],
                "artifactPlugins":["blob"],
                "outputs":{"parameters":[{"name":"p","valueFrom":{"path":"/tmp/p"}}],
                           "artifacts":[{"name":"a","path":"/tmp/a"}]}}"#,
        )
        .unwrap();
        let executor = testing::executor(tmp.path(), template, cluster.clone()).with_default_repository(Some(
            serde_json::from_value(serde_json::json!({"volume":{"name":"repo"}})).unwrap(),
        ));
        let vra = &executor.options.var_run_argo;
        vra.stdout_file("main").write_string("hi\n").await.unwrap();
        vra.output_parameter_file("/tmp/p").write_string("v").await.unwrap();
        let src = tmp.path().join("src/a");
        File::new(&src).write_string("data").await.unwrap();
        tar_gz(&src, vra.output_artifact_file("/tmp/a").path(), None).await.unwrap();
        vra.exitcode_file("main").write_string("0").await.unwrap();

        executor.wait().await.unwrap();

        let api: Api<WorkflowTaskResult> = Api::namespaced(cluster, "argo");
        let stored = api.get("wf-123").await.unwrap();
        assert!(stored.outputs_completed());
        let outputs = stored.result.outputs.as_ref().unwrap();
        assert_eq!(outputs.result.as_deref(), Some("hi"));
        assert_eq!(outputs.exit_code.as_deref(), Some("0"));
        assert_eq!(outputs.parameters[0].value.as_deref(), Some("v"));
        assert_eq!(outputs.artifacts[0].name, "a");
        assert_eq!(stored.result.phase, None);

        assert_eq!(vra.signal_file("db").read_string().await.unwrap(), "15");
        assert_eq!(vra.signal_file("artifact-plugin-blob").read_string().await.unwrap(), "15");
        assert_eq!(executor.tracer().violations(), 0);
    }

    #[tokio::test]
    async fn test_wait_surfaces_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let cluster = Arc::new(InMemoryCluster::new());
        let template: Template = serde_json::from_str(
            r#"{"name":"c","container":{"image":"busybox"},
                "outputs":{"parameters":[{"name":"p","valueFrom":{"path":"/tmp/p"}}]}}"#,
        )
        .unwrap();
        let executor = testing::executor(tmp.path(), template, cluster.clone());
        executor
            .options
            .var_run_argo
            .exitcode_file("main")
            .write_string("1")
            .await
            .unwrap();

        let err = executor.wait().await.unwrap_err();
        assert!(err.to_string().contains("output parameter p"));
        let api: Api<WorkflowTaskResult> = Api::namespaced(cluster, "argo");
        let stored = api.get("wf-123").await.unwrap();
        assert!(stored.result.message.contains("/tmp/p"));
        assert_eq!(stored.result.outputs.as_ref().unwrap().exit_code.as_deref(), Some("1"));
    }
}
