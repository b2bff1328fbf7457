//! `resource` role: act on a cluster object and wait for its conditions

use std::fmt;

use serde_json::Value;
use tracing::{debug, info, warn};
use workflow_api::template::ResourceTemplate;
use workflow_api::{NodeResult, Outputs, Parameter};

use super::WorkflowExecutor;
use crate::cluster::{set_path, ResourceType};
use crate::errors::WfError;
use crate::expr::jsonpath;
use crate::telemetry::attributes::{ATTRIB_WORKFLOW_NAME, ATTRIB_WORKFLOW_NAMESPACE};
use crate::telemetry::spans::RUN_WAIT_CONTAINER;

// ====== CONDITIONS ====== //

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
    GreaterThan,
    LessThan,
}

/// One clause of a label-selector style condition, matched against object JSON
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.values.join(",");
        match self.operator {
            Operator::Equals => write!(f, "{} == {}", self.key, values),
            Operator::NotEquals => write!(f, "{} != {}", self.key, values),
            Operator::In => write!(f, "{} in ({})", self.key, values),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, values),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
            Operator::GreaterThan => write!(f, "{} > {}", self.key, values),
            Operator::LessThan => write!(f, "{} < {}", self.key, values),
        }
    }
}

impl Requirement {
    fn lookup(&self, object: &Value) -> Option<String> {
        match jsonpath::query(object, &self.key) {
            Ok(values) => values.first().map(jsonpath::render),
            Err(_) => None,
        }
    }

    pub fn matches(&self, object: &Value) -> bool {
        let value = self.lookup(object);
        match self.operator {
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
            Operator::Equals | Operator::In => value.map(|v| self.values.contains(&v)).unwrap_or(false),
            Operator::NotEquals | Operator::NotIn => value.map(|v| !self.values.contains(&v)).unwrap_or(true),
            Operator::GreaterThan | Operator::LessThan => {
                let (Some(actual), Some(bound)) = (
                    value.and_then(|v| v.parse::<i64>().ok()),
                    self.values.first().and_then(|v| v.parse::<i64>().ok()),
                ) else {
                    return false;
                };
                if self.operator == Operator::GreaterThan {
                    actual > bound
                } else {
                    actual < bound
                }
            }
        }
    }
}

fn split_clauses(selector: &str) -> Vec<&str> {
    let mut clauses = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                clauses.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    clauses.push(&selector[start..]);
    clauses.into_iter().map(str::trim).filter(|c| !c.is_empty()).collect()
}

fn parse_set(raw: &str, clause: &str) -> Result<Vec<String>, WfError> {
    let inner = raw
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| WfError::BadRequest(format!("expected a value set in '{}'", clause)))?;
    Ok(inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect())
}

fn parse_clause(clause: &str) -> Result<Requirement, WfError> {
    let requirement = |key: &str, operator, values| Requirement {
        key: key.trim().to_string(),
        operator,
        values,
    };
    if let Some(key) = clause.strip_prefix('!') {
        return Ok(requirement(key, Operator::DoesNotExist, Vec::new()));
    }
    for (token, operator) in [(" notin ", Operator::NotIn), (" in ", Operator::In)] {
        if let Some((key, set)) = clause.split_once(token) {
            return Ok(requirement(key, operator, parse_set(set, clause)?));
        }
    }
    for (token, operator) in [
        ("==", Operator::Equals),
        ("!=", Operator::NotEquals),
        ("=", Operator::Equals),
        (">", Operator::GreaterThan),
        ("<", Operator::LessThan),
    ] {
        if let Some((key, value)) = clause.split_once(token) {
            let value = value.trim().to_string();
            if matches!(operator, Operator::GreaterThan | Operator::LessThan) && value.parse::<i64>().is_err() {
                return Err(WfError::BadRequest(format!(
                    "'{}' requires an integer value in '{}'",
                    token, clause
                )));
            }
            return Ok(requirement(key, operator, vec![value]));
        }
    }
    if clause.contains(char::is_whitespace) {
        return Err(WfError::BadRequest(format!("invalid requirement '{}'", clause)));
    }
    Ok(requirement(clause, Operator::Exists, Vec::new()))
}

/// Parse a comma-separated condition such as `status.phase == Succeeded,status.succeeded > 0`
pub fn parse_requirements(selector: &str) -> Result<Vec<Requirement>, WfError> {
    split_clauses(selector).into_iter().map(parse_clause).collect()
}

/// Outcome of one poll of the resource state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceState {
    Succeeded,
    Failed(String),
    Pending,
}

/// Check failure requirements first; every success requirement must match
pub fn evaluate_conditions(object: &Value, success: &[Requirement], failure: &[Requirement]) -> ResourceState {
    for requirement in failure {
        if requirement.matches(object) {
            return ResourceState::Failed(format!("failure condition '{}' evaluated true", requirement));
        }
    }
    let matched = success.iter().filter(|r| r.matches(object)).count();
    debug!("{}/{} success conditions matched", matched, success.len());
    if matched >= success.len() {
        ResourceState::Succeeded
    } else {
        ResourceState::Pending
    }
}

// ====== EXECUTION ====== //

/// Coordinates of the object a resource template acted on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub resource_type: ResourceType,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}.{}/{}",
            self.namespace, self.resource_type.kind, self.resource_type.group, self.name
        )
    }
}

impl ResourceRef {
    fn from_object(object: &Value, default_namespace: &str) -> Result<Self, WfError> {
        let resource_type = ResourceType::from_object(object)?;
        let namespace = object
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace)
            .to_string();
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Ok(Self {
            resource_type,
            namespace,
            name,
        })
    }
}

impl WorkflowExecutor {
    fn resource_template(&self) -> Result<&ResourceTemplate, WfError> {
        self.template
            .resource
            .as_ref()
            .ok_or_else(|| WfError::BadRequest(format!("template '{}' is not a resource template", self.template.name)))
    }

    /// Manifest to act on: the staged file, else the template's own manifest
    async fn resource_manifest(&self, resource: &ResourceTemplate) -> Result<String, WfError> {
        let manifest = match self.options.layout.manifest_file().read_string_opt().await? {
            Some(staged) => staged,
            None => resource.manifest.clone(),
        };
        if !manifest.trim().is_empty() {
            return Ok(manifest);
        }
        manifest_from_flags(&resource.flags)
    }

    fn owned_manifest(&self, manifest: &str) -> Result<String, WfError> {
        let mut object: Value = workflow_api::yaml::parse_one(manifest)?;
        let mut owners = object
            .pointer("/metadata/ownerReferences")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        owners.push(self.workflow_owner_reference());
        set_path(&mut object, &["metadata", "ownerReferences"], Value::Array(owners));
        Ok(serde_json::to_string(&object)?)
    }

    /// Run the resource action, wait for its conditions and report parameters
    pub async fn execute_resource(&self) -> Result<(), WfError> {
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
        match self.run_resource_action().await {
            Ok(reference) => {
                if let Err(e) = self.save_resource_parameters(reference.as_ref(), &mut outputs).await {
                    self.record_error(e);
                }
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

    /// Perform the action; returns the object to watch unless it was deleted
    pub async fn run_resource_action(&self) -> Result<Option<ResourceRef>, WfError> {
        let resource = self.resource_template()?;
        let mut manifest = self.resource_manifest(resource).await?;
        if resource.set_owner_reference {
            manifest = self.owned_manifest(&manifest)?;
        }
        let action = resource.action.as_str();
        let namespace = &self.options.env.namespace;
        info!("performing resource action '{}'", action);
        let object = self
            .client()
            .apply_manifest(namespace, action, &manifest, &resource.merge_strategy)
            .await?;
        if action == "delete" {
            return Ok(None);
        }
        let reference = ResourceRef::from_object(&object, namespace)?;
        info!("resource {}", reference);
        self.wait_resource(&reference, resource).await?;
        Ok(Some(reference))
    }

    /// Poll the object until a failure or every success requirement matches
    pub async fn wait_resource(&self, reference: &ResourceRef, resource: &ResourceTemplate) -> Result<(), WfError> {
        if resource.success_condition.is_empty() && resource.failure_condition.is_empty() {
            return Ok(());
        }
        let success = parse_requirements(&resource.success_condition).map_err(|e| {
            WfError::BadRequest(format!("success condition '{}' failed to parse: {}", resource.success_condition, e))
        })?;
        let failure = parse_requirements(&resource.failure_condition).map_err(|e| {
            WfError::BadRequest(format!("fail condition '{}' failed to parse: {}", resource.failure_condition, e))
        })?;
        info!("waiting for resource {} conditions", reference);
        loop {
            match self
                .client()
                .get_resource_json(&reference.resource_type, &reference.namespace, &reference.name)
                .await
            {
                Ok(object) => match evaluate_conditions(&object, &success, &failure) {
                    ResourceState::Succeeded => {
                        info!("resource {} satisfied its success condition", reference.name);
                        return Ok(());
                    }
                    ResourceState::Failed(message) => return Err(WfError::BadRequest(message)),
                    ResourceState::Pending => {}
                },
                Err(e) if e.is_not_found() => {
                    return Err(WfError::NotFound(format!(
                        "resource {} in namespace {} has been deleted",
                        reference.name, reference.namespace
                    )))
                }
                Err(e) if e.is_transient() => warn!("retrying resource state check: {}", e),
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.options.env.resource_state_check_interval).await;
        }
    }

    /// Output parameters from `jsonPath` or `jqFilter` over the current object
    pub async fn save_resource_parameters(
        &self,
        reference: Option<&ResourceRef>,
        outputs: &mut Outputs,
    ) -> Result<(), WfError> {
        if self.template.outputs.parameters.is_empty() {
            return Ok(());
        }
        let object = match reference {
            Some(r) => Some(
                self.client()
                    .get_resource_json(&r.resource_type, &r.namespace, &r.name)
                    .await?,
            ),
            None => None,
        };
        for param in &self.template.outputs.parameters {
            let Some(value_from) = &param.value_from else {
                continue;
            };
            let path = if !value_from.json_path.is_empty() {
                &value_from.json_path
            } else {
                &value_from.jq_filter
            };
            let value = match &object {
                None => value_from.default.clone().unwrap_or_default(),
                Some(_) if path.is_empty() => continue,
                Some(object) => match jsonpath::query_one(object, path) {
                    Ok(selected) => jsonpath::render(&selected),
                    Err(e) => match &value_from.default {
                        Some(default) => default.clone(),
                        None => return Err(WfError::BadRequest(format!("output parameter {}: {}", param.name, e))),
                    },
                },
            };
            info!("saved output parameter: {}, value: {}", param.name, value);
            outputs.parameters.push(Parameter::with_value(&param.name, &value));
        }
        Ok(())
    }
}

/// Minimal manifest naming an object from `[kind, name]` or `[kind/name]` flags
fn manifest_from_flags(flags: &[String]) -> Result<String, WfError> {
    let positional: Vec<&str> = flags.iter().map(String::as_str).filter(|f| !f.starts_with('-')).collect();
    let (kind, name) = match positional.as_slice() {
        [] => {
            return Err(WfError::BadRequest(
                "Must provide at least one of flags or manifest.".to_string(),
            ))
        }
        [reference] => reference
            .split_once('/')
            .ok_or_else(|| WfError::BadRequest(format!("cannot resolve resource from flag '{}'", reference)))?,
        [kind, name, ..] => (*kind, *name),
    };
    let resource_type = ResourceType::for_kind_name(kind);
    let object = serde_json::json!({
        "apiVersion": resource_type.api_version(),
        "kind": resource_type.kind,
        "metadata": {"name": name},
    });
    Ok(serde_json::to_string(&object)?)
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use crate::cluster::{Api, ClusterClient, InMemoryCluster};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use workflow_api::{Template, WorkflowTaskResult};

    #[test]
    fn test_parse_requirements() {
        let reqs = parse_requirements("status.phase == Succeeded, metadata.name in (a, b),!status.error").unwrap();
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0].operator, Operator::Equals);
        assert_eq!(reqs[1].values, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(reqs[2].operator, Operator::DoesNotExist);
        assert!(parse_requirements("status.succeeded > x").is_err());
    }

    #[test]
    fn test_requirements_match_json() {
        let object = json!({"metadata": {"name": "a"}, "status": {"phase": "Running", "succeeded": 2}});
        let check = |s: &str| parse_requirements(s).unwrap().iter().all(|r| r.matches(&object));
        assert!(check("status.phase == Running"));
        assert!(check("status.succeeded > 1"));
        assert!(!check("status.succeeded < 1"));
        assert!(check("metadata.name in (a,b)"));
        assert!(check("status.failed != 1"));
        assert!(check("status"));
        assert!(!check("status.failed"));
    }

    #[test]
    fn test_failure_wins() {
        let object = json!({"status": {"phase": "Failed"}});
        let success = parse_requirements("status.phase == Failed").unwrap();
        let failure = parse_requirements("status.phase == Failed").unwrap();
        assert_eq!(
            evaluate_conditions(&object, &success, &failure),
            ResourceState::Failed("failure condition 'status.phase == Failed' evaluated true".to_string())
        );
        assert_eq!(evaluate_conditions(&object, &success, &[]), ResourceState::Succeeded);
    }

    fn resource_template(resource: Value) -> Template {
        serde_json::from_value(json!({
            "name": "r",
            "resource": resource,
            "outputs": {"parameters": [
                {"name": "phase", "valueFrom": {"jsonPath": "{.status.phase}"}},
                {"name": "owner", "valueFrom": {"jqFilter": ".metadata.ownerReferences[0].name"}}
            ]}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_waits_for_success_and_saves_parameters() {
        let tmp = tempfile::tempdir().unwrap();
        let cluster = Arc::new(InMemoryCluster::new());
        let template = resource_template(json!({
            "action": "create",
            "setOwnerReference": true,
            "successCondition": "status.phase == Done",
            "manifest": "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n"
        }));
        let mut executor = testing::executor(tmp.path(), template, cluster.clone());
        executor.options.env.resource_state_check_interval = Duration::from_millis(10);

        let rt = ResourceType::config_map();
        let finisher = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    if cluster
                        .patch(&rt, "argo", "cm", &json!({"status": {"phase": "Done"}}))
                        .await
                        .is_ok()
                    {
                        break;
                    }
                }
            })
        };
        executor.execute_resource().await.unwrap();
        finisher.await.unwrap();

        let api: Api<WorkflowTaskResult> = Api::namespaced(cluster, "argo");
        let stored = api.get("wf-123").await.unwrap();
        let outputs = stored.result.outputs.as_ref().unwrap();
        assert_eq!(outputs.parameters[0].value.as_deref(), Some("Done"));
        assert_eq!(outputs.parameters[1].value.as_deref(), Some("wf"));
        assert!(stored.outputs_completed());
    }

    #[tokio::test]
    async fn test_failure_condition_fails_node() {
        let tmp = tempfile::tempdir().unwrap();
        let cluster = Arc::new(InMemoryCluster::new());
        let template = resource_template(json!({
            "action": "apply",
            "failureCondition": "status.phase == Broken",
            "manifest": "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\nstatus:\n  phase: Broken\n"
        }));
        let executor = testing::executor(tmp.path(), template, cluster.clone());
        let err = executor.execute_resource().await.unwrap_err();
        assert!(err.to_string().contains("failure condition 'status.phase == Broken' evaluated true"));

        let api: Api<WorkflowTaskResult> = Api::namespaced(cluster, "argo");
        assert!(api.get("wf-123").await.unwrap().result.message.contains("evaluated true"));
    }

    #[tokio::test]
    async fn test_delete_uses_parameter_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cluster = Arc::new(InMemoryCluster::new());
        let template: Template = serde_json::from_value(json!({
            "name": "r",
            "resource": {"action": "delete", "flags": ["configmap", "cm"]},
            "outputs": {"parameters": [{"name": "p", "valueFrom": {"jsonPath": "{.x}", "default": "gone"}}]}
        }))
        .unwrap();
        let executor = testing::executor(tmp.path(), template, cluster.clone());
        executor.execute_resource().await.unwrap();

        let api: Api<WorkflowTaskResult> = Api::namespaced(cluster, "argo");
        let outputs = api.get("wf-123").await.unwrap().result.outputs.unwrap();
        assert_eq!(outputs.parameters[0].value.as_deref(), Some("gone"));
    }

    #[test]
    fn test_manifest_from_flags() {
        assert!(manifest_from_flags(&[]).is_err());
        let manifest = manifest_from_flags(&["pod/p1".to_string()]).unwrap();
        let object: Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(object["kind"], "Pod");
        assert_eq!(object["metadata"]["name"], "p1");
    }
}
