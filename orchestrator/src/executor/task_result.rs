//! Upsert of the `WorkflowTaskResult` that carries a node's outputs

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{debug, info};
use workflow_api::common::{LABEL_KEY_REPORT_OUTPUTS_COMPLETED, LABEL_KEY_WORKFLOW};
use workflow_api::{NodeResult, ObjectMeta, OwnerReference, Workflow, WorkflowTaskResult};

use super::WorkflowExecutor;
use crate::cluster::Api;
use crate::errors::WfError;
use crate::telemetry::spans::{CREATE_TASK_RESULT, PATCH_TASK_RESULT, PATCH_TASK_RESULT_LABELS};
use crate::telemetry::TraceSpan;
use crate::utils::retry_on_error;

fn retriable(e: &WfError) -> bool {
    e.is_transient() || e.is_conflict()
}

impl WorkflowExecutor {
    fn task_results(&self) -> Api<WorkflowTaskResult> {
        Api::namespaced(self.client().clone(), &self.options.env.namespace)
    }

    /// Metadata of a fresh task result for this node
    pub fn task_result_meta(&self) -> ObjectMeta {
        let env = &self.options.env;
        let mut meta = ObjectMeta::named(&env.namespace, &env.node_id);
        meta.labels
            .insert(LABEL_KEY_WORKFLOW.to_string(), env.workflow_name.clone());
        meta.labels
            .insert(LABEL_KEY_REPORT_OUTPUTS_COMPLETED.to_string(), "false".to_string());
        meta.owner_references.push(OwnerReference {
            api_version: workflow_api::api_version(),
            kind: "Workflow".to_string(),
            name: env.workflow_name.clone(),
            uid: env.workflow_uid.clone(),
            ..Default::default()
        });
        meta
    }

    /// Create the task result, or merge `result` into the existing one
    pub async fn report_result(&self, result: &NodeResult, parent: &TraceSpan) -> Result<(), WfError> {
        retry_on_error(&self.options.backoff, retriable, || self.upsert_result(result, parent)).await
    }

    async fn upsert_result(&self, result: &NodeResult, parent: &TraceSpan) -> Result<(), WfError> {
        let api = self.task_results();
        let mut task_result = WorkflowTaskResult::new(self.task_result_meta());
        task_result.result = result.clone();
        {
            let _span = self.tracer().start(CREATE_TASK_RESULT, Some(parent), &[]);
            match api.create(&task_result).await {
                Ok(_) => {
                    info!("created task result {}", self.options.env.node_id);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => debug!("task result exists, patching"),
                Err(e) => return Err(e),
            }
        }
        let _span = self.tracer().start(PATCH_TASK_RESULT, Some(parent), &[]);
        let patch = serde_json::to_value(result)?;
        if patch.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            return Ok(());
        }
        api.patch(&self.options.env.node_id, &patch).await?;
        info!("patched task result {}", self.options.env.node_id);
        Ok(())
    }

    /// Mark every output as reported
    pub async fn finalize_result(&self, parent: &TraceSpan) -> Result<(), WfError> {
        let _span = self.tracer().start(PATCH_TASK_RESULT_LABELS, Some(parent), &[]);
        let api = &self.task_results();
        let labels = &BTreeMap::from([(
            LABEL_KEY_REPORT_OUTPUTS_COMPLETED.to_string(),
            Some("true".to_string()),
        )]);
        retry_on_error(&self.options.backoff, retriable, || async move {
            match api.patch_labels(&self.options.env.node_id, labels).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_not_found() => {
                    let mut meta = self.task_result_meta();
                    meta.labels
                        .insert(LABEL_KEY_REPORT_OUTPUTS_COMPLETED.to_string(), "true".to_string());
                    api.create(&WorkflowTaskResult::new(meta)).await.map(|_| ())
                }
                Err(e) => Err(e),
            }
        })
        .await?;
        info!("task result {} reported outputs completed", self.options.env.node_id);
        Ok(())
    }

    /// Owner reference to the running workflow, for resources the executor creates
    pub fn workflow_owner_reference(&self) -> Value {
        let env = &self.options.env;
        json!({
            "apiVersion": workflow_api::api_version(),
            "kind": <Workflow as workflow_api::Resource>::KIND,
            "name": env.workflow_name,
            "uid": env.workflow_uid,
            "controller": true,
            "blockOwnerDeletion": true,
        })
    }
}
