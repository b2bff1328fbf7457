//! Variables visible to a template while the controller renders it

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use workflow_api::{Artifact, NodeStatus, Outputs};

use crate::errors::WfError;
use crate::template;

#[derive(Debug, Clone, Default)]
pub struct Scope {
    params: BTreeMap<String, String>,
    artifacts: BTreeMap<String, Artifact>,
}

impl Scope {
    pub fn new(globals: &BTreeMap<String, String>) -> Self {
        Self {
            params: globals.clone(),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn add_param(&mut self, key: &str, value: &str) {
        self.params.insert(key.to_string(), value.to_string());
    }

    pub fn add_artifact(&mut self, key: &str, artifact: Artifact) {
        self.artifacts.insert(key.to_string(), artifact);
    }

    /// Resolve `{{steps.x.outputs.artifacts.y}}` to the artifact it names
    pub fn resolve_artifact(&self, from: &str) -> Result<Artifact, WfError> {
        let key = from
            .trim()
            .strip_prefix("{{")
            .and_then(|k| k.strip_suffix("}}"))
            .map(str::trim)
            .unwrap_or(from);
        self.artifacts
            .get(key)
            .cloned()
            .ok_or_else(|| WfError::BadRequest(format!("unable to resolve artifact reference '{}'", from)))
    }

    /// Resolve a `valueFrom.parameter` reference
    pub fn resolve_parameter(&self, reference: &str) -> Result<String, WfError> {
        template::replace_str(reference, &self.params, false)
    }

    /// Publish the outputs and status of `node` under `prefix`
    pub fn add_node_outputs(&mut self, prefix: &str, node: &NodeStatus) {
        self.add_param(&format!("{}.id", prefix), &node.id);
        self.add_param(&format!("{}.status", prefix), node.phase.as_str());
        if let Some(started) = node.started_at {
            self.add_param(&format!("{}.startedAt", prefix), &started.to_rfc3339());
        }
        if let Some(finished) = node.finished_at {
            self.add_param(&format!("{}.finishedAt", prefix), &finished.to_rfc3339());
        }
        let Some(outputs) = &node.outputs else {
            return;
        };
        if let Some(result) = &outputs.result {
            self.add_param(&format!("{}.outputs.result", prefix), result);
        }
        if let Some(code) = &outputs.exit_code {
            self.add_param(&format!("{}.exitCode", prefix), code);
        }
        let mut all = Map::new();
        for param in &outputs.parameters {
            let value = param.value.clone().unwrap_or_default();
            self.add_param(&format!("{}.outputs.parameters.{}", prefix, param.name), &value);
            all.insert(param.name.clone(), Value::String(value));
        }
        if !all.is_empty() {
            self.add_param(
                &format!("{}.outputs.parameters", prefix),
                &Value::Object(all).to_string(),
            );
        }
        for artifact in &outputs.artifacts {
            self.add_artifact(&format!("{}.outputs.artifacts.{}", prefix, artifact.name), artifact.clone());
        }
    }

    /// Publish the outputs of fanned-out children as JSON lists under `prefix`
    pub fn add_aggregated_outputs(&mut self, prefix: &str, nodes: &[&NodeStatus]) {
        let mut results = Vec::new();
        let mut per_node = Vec::new();
        let mut by_name: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for node in nodes {
            let Some(outputs) = &node.outputs else {
                continue;
            };
            if let Some(result) = &outputs.result {
                results.push(serde_json::from_str(result).unwrap_or_else(|_| Value::String(result.clone())));
            }
            if !outputs.parameters.is_empty() {
                let mut params = Map::new();
                for param in &outputs.parameters {
                    let value = param.value.clone().unwrap_or_default();
                    by_name
                        .entry(param.name.clone())
                        .or_default()
                        .push(Value::String(value.clone()));
                    params.insert(param.name.clone(), Value::String(value));
                }
                per_node.push(Value::Object(params));
            }
        }
        self.add_param(&format!("{}.outputs.result", prefix), &json!(results).to_string());
        self.add_param(&format!("{}.outputs.parameters", prefix), &json!(per_node).to_string());
        for (name, values) in by_name {
            self.add_param(
                &format!("{}.outputs.parameters.{}", prefix, name),
                &json!(values).to_string(),
            );
        }
        let phases: Vec<&str> = nodes.iter().map(|n| n.phase.as_str()).collect();
        self.add_param(&format!("{}.status", prefix), &json!(phases).to_string());
    }

    /// Outputs of a steps or DAG template, taken from the scope of its children
    pub fn resolve_outputs(&self, declared: &Outputs) -> Result<Option<Outputs>, WfError> {
        if declared.is_empty() {
            return Ok(None);
        }
        let mut outputs = Outputs::default();
        for param in &declared.parameters {
            let mut resolved = param.clone();
            if let Some(from) = param.value_from.as_ref().filter(|v| !v.parameter.is_empty()) {
                let value = match self.resolve_parameter(&from.parameter) {
                    Ok(value) => value,
                    Err(e) => match &from.default {
                        Some(default) => default.clone(),
                        None => return Err(e),
                    },
                };
                resolved.value = Some(value);
                resolved.value_from = None;
            } else if let Some(value) = &param.value {
                resolved.value = Some(self.resolve_parameter(value)?);
            }
            outputs.parameters.push(resolved);
        }
        for artifact in &declared.artifacts {
            if artifact.from.is_empty() {
                outputs.artifacts.push(artifact.clone());
                continue;
            }
            match self.resolve_artifact(&artifact.from) {
                Ok(mut resolved) => {
                    resolved.name = artifact.name.clone();
                    resolved.global_name = artifact.global_name.clone();
                    outputs.artifacts.push(resolved);
                }
                Err(_) if artifact.optional => {}
                Err(e) => return Err(e),
            }
        }
        Ok(Some(outputs))
    }
}
