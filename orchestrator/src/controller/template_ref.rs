//! Resolving `spec.workflowTemplateRef`

use workflow_api::{Workflow, WorkflowSpec, WorkflowTemplate};

use crate::cluster::{Api, ResourceType, SharedClient};
use crate::errors::WfError;

/// Overlay a workflow's own spec on the spec of the template it references
///
/// Templates, parameters and artifacts merge by name with the workflow's
/// entries winning; any other field the workflow sets replaces the
/// template's.
pub fn merge_spec(wf: &WorkflowSpec, base: &WorkflowSpec) -> WorkflowSpec {
    let mut spec = base.clone();
    for template in &wf.templates {
        match spec.templates.iter_mut().find(|t| t.name == template.name) {
            Some(existing) => *existing = template.clone(),
            None => spec.templates.push(template.clone()),
        }
    }
    for param in &wf.arguments.parameters {
        match spec.arguments.parameters.iter_mut().find(|p| p.name == param.name) {
            Some(existing) => *existing = param.clone(),
            None => spec.arguments.parameters.push(param.clone()),
        }
    }
    for artifact in &wf.arguments.artifacts {
        match spec.arguments.artifacts.iter_mut().find(|a| a.name == artifact.name) {
            Some(existing) => *existing = artifact.clone(),
            None => spec.arguments.artifacts.push(artifact.clone()),
        }
    }
    if !wf.entrypoint.is_empty() {
        spec.entrypoint = wf.entrypoint.clone();
    }
    if !wf.service_account_name.is_empty() {
        spec.service_account_name = wf.service_account_name.clone();
    }
    if !wf.on_exit.is_empty() {
        spec.on_exit = wf.on_exit.clone();
    }
    spec.volumes.extend(wf.volumes.iter().cloned());
    spec.pod_gc = wf.pod_gc.clone().or(spec.pod_gc);
    spec.ttl_strategy = wf.ttl_strategy.clone().or(spec.ttl_strategy);
    spec.shutdown = wf.shutdown.or(spec.shutdown);
    spec.active_deadline_seconds = wf.active_deadline_seconds.or(spec.active_deadline_seconds);
    spec.parallelism = wf.parallelism.or(spec.parallelism);
    spec.synchronization = wf.synchronization.clone().or(spec.synchronization);
    spec.archive_logs = wf.archive_logs.or(spec.archive_logs);
    spec.pod_spec_grace_period_seconds = wf
        .pod_spec_grace_period_seconds
        .or(spec.pod_spec_grace_period_seconds);
    spec.workflow_template_ref = None;
    spec
}

/// The spec a workflow runs with, fetching its template reference if any
pub async fn effective_spec(client: &SharedClient, wf: &Workflow) -> Result<WorkflowSpec, WfError> {
    let Some(reference) = &wf.spec.workflow_template_ref else {
        return Ok(wf.spec.clone());
    };
    let api: Api<WorkflowTemplate> = if reference.cluster_scope {
        Api::with_type(client.clone(), ResourceType::cluster_workflow_template(), "")
    } else {
        Api::namespaced(client.clone(), wf.namespace())
    };
    let template = api.get(&reference.name).await.map_err(|e| {
        if e.is_not_found() {
            WfError::BadRequest(format!("workflow template {} not found", reference.name))
        } else {
            e
        }
    })?;
    Ok(merge_spec(&wf.spec, &template.spec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workflow_fields_win() {
        let base: WorkflowSpec = serde_json::from_value(json!({
            "entrypoint": "main",
            "arguments": {"parameters": [{"name": "a", "value": "1"}, {"name": "b", "value": "2"}]},
            "templates": [
                {"name": "main", "container": {"image": "alpine", "command": ["echo"]}},
                {"name": "other", "container": {"image": "alpine", "command": ["echo"]}}
            ],
            "activeDeadlineSeconds": 60
        }))
        .unwrap();
        let wf: WorkflowSpec = serde_json::from_value(json!({
            "arguments": {"parameters": [{"name": "b", "value": "override"}]},
            "templates": [{"name": "other", "container": {"image": "busybox", "command": ["echo"]}}],
            "workflowTemplateRef": {"name": "base"}
        }))
        .unwrap();

        let spec = merge_spec(&wf, &base);
        assert_eq!(spec.entrypoint, "main");
        assert_eq!(spec.templates.len(), 2);
        assert_eq!(
            spec.template("other").unwrap().container.as_ref().unwrap().image,
            "busybox"
        );
        assert_eq!(
            spec.arguments.parameter("b").unwrap().value.as_deref(),
            Some("override")
        );
        assert_eq!(spec.arguments.parameter("a").unwrap().value.as_deref(), Some("1"));
        assert_eq!(spec.active_deadline_seconds, Some(60));
        assert!(spec.workflow_template_ref.is_none());
    }
}
