//! `data` role: evaluate a data template and report its result

use tracing::info;
use workflow_api::{NodeResult, Outputs};

use super::WorkflowExecutor;
use crate::errors::WfError;
use crate::telemetry::attributes::{ATTRIB_WORKFLOW_NAME, ATTRIB_WORKFLOW_NAMESPACE};
use crate::telemetry::spans::RUN_WAIT_CONTAINER;

impl WorkflowExecutor {
    pub async fn execute_data(&self) -> Result<(), WfError> {
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
        let evaluated = match &self.template.data {
            Some(data) => crate::data::process(data, self.factory()).await,
            None => Err(WfError::BadRequest(format!(
                "template '{}' is not a data template",
                self.template.name
            ))),
        };
        match evaluated {
            Ok(result) => {
                info!("data template produced {} bytes", result.len());
                outputs.result = Some(result);
            }
            Err(e) => self.record_error(e),
        }

        let result = NodeResult {
            message: self.error_message(),
            outputs: (!outputs.is_empty()).then_some(outputs),
            ..Default::default()
        };
        if let Err(e) = self.report_result(&result, &root).await {
            self.record_error(e);
        }
        if let Err(e) = self.finalize_result(&root).await {
            self.record_error(e);
        }
        if self.has_errors() {
            return Err(WfError::BadRequest(self.error_message()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use crate::cluster::{Api, InMemoryCluster};
    use std::sync::Arc;
    use workflow_api::{Template, WorkflowTaskResult};

    #[tokio::test]
    async fn test_data_result_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("mnt/data/in");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.csv"), "1").unwrap();
        std::fs::write(dir.join("b.txt"), "2").unwrap();
        let template: Template = serde_json::from_value(serde_json::json!({
            "name": "d",
            "data": {
                "source": {"artifactPaths": {"name": "in", "volume": {"name": "data", "path": "in"}}},
                "transformation": [{"expression": "filter(data, {# endsWith '.csv'})"}]
            }
        }))
        .unwrap();
        let cluster = Arc::new(InMemoryCluster::new());
        let executor = testing::executor(tmp.path(), template, cluster.clone());
        executor.execute_data().await.unwrap();

        let api: Api<WorkflowTaskResult> = Api::namespaced(cluster, "argo");
        let stored = api.get("wf-123").await.unwrap();
        assert_eq!(stored.result.outputs.as_ref().unwrap().result.as_deref(), Some(r#"["in/a.csv"]"#));
        assert!(stored.outputs_completed());
    }

    #[tokio::test]
    async fn test_non_data_template_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let cluster = Arc::new(InMemoryCluster::new());
        let executor = testing::executor(tmp.path(), Template::default(), cluster.clone());
        assert!(executor.execute_data().await.is_err());
        let api: Api<WorkflowTaskResult> = Api::namespaced(cluster, "argo");
        assert!(api.get("wf-123").await.unwrap().result.message.contains("not a data template"));
    }
}
