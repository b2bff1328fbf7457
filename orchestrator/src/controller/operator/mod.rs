//! One reconciliation pass over a workflow
//!
//! The operator walks the template graph from the entrypoint, creating nodes
//! and pods as their inputs become available. It performs no I/O: the
//! controller loads pods, task results and the task set beforehand, then
//! applies the returned [`Outcome`] together with the updated workflow.

mod assess;
mod dag;
pub mod expand;
mod steps;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use workflow_api::common::LABEL_KEY_PHASE;
use workflow_api::workflow::ShutdownStrategy;
use workflow_api::{
    Arguments, Artifact, Backoff, NodePhase, NodeStatus, NodeType, Pod, RetryPolicy, RetryStrategy,
    Template, TemplateType, Workflow, WorkflowPhase, WorkflowSpec, WorkflowTaskResult, WorkflowTaskSet,
};

use self::expand::Expandable;
use super::estimation::Estimator;
use super::pod_spec::{build_pod, PodRequest};
use super::scope::Scope;
use super::validate::validate_workflow;
use crate::errors::WfError;
use crate::storage::settings::Settings;
use crate::template;
use crate::utils::{fnv32a, format_duration, parse_duration};

pub use self::assess::pod_phase;

/// Attempts of a retry node that may finish within one pass
const MAX_ATTEMPTS_PER_PASS: usize = 3;

/// ID of the node called `node_name`; the root node takes the workflow name
pub fn node_id(wf_name: &str, node_name: &str) -> String {
    if node_name == wf_name {
        wf_name.to_string()
    } else {
        format!("{}-{}", wf_name, fnv32a(node_name.as_bytes()))
    }
}

/// Last `.`-separated segment of a node name, ignoring dots inside `()` and `[]`
pub fn display_name(name: &str) -> String {
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in name.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            '.' if depth == 0 => start = i + 1,
            _ => {}
        }
    }
    name[start..].to_string()
}

fn node_type_for(template: &Template) -> NodeType {
    match template.template_type() {
        Ok(TemplateType::Steps) => NodeType::Steps,
        Ok(TemplateType::Dag) => NodeType::Dag,
        Ok(TemplateType::Http) => NodeType::Http,
        Ok(TemplateType::Suspend) => NodeType::Suspend,
        _ => NodeType::Pod,
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Wait before the next attempt: `duration * factor^(attempts-1)`, capped by `maxDuration`
fn backoff_delay(backoff: &Backoff, attempts: usize) -> Result<Duration, WfError> {
    let Some(base) = &backoff.duration else {
        return Ok(Duration::ZERO);
    };
    let base = parse_duration(base)?;
    let factor = backoff.factor.unwrap_or(2.0);
    let exponent = attempts.saturating_sub(1).min(64) as i32;
    let seconds = base.as_secs_f64() * factor.powi(exponent);
    let mut delay = Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX);
    if let Some(max) = &backoff.max_duration {
        delay = delay.min(parse_duration(max)?);
    }
    Ok(delay)
}

fn parse_progress(progress: &str) -> Option<(u64, u64)> {
    let (done, total) = progress.split_once('/')?;
    Some((done.trim().parse().ok()?, total.trim().parse().ok()?))
}

/// Cluster state the operator reads
#[derive(Debug, Default)]
pub struct OperatorInputs {
    /// Effective spec, with any workflow template reference merged in
    pub spec: WorkflowSpec,
    pub pods: Vec<Pod>,
    pub task_results: Vec<WorkflowTaskResult>,
    pub task_set: Option<WorkflowTaskSet>,
    pub estimator: Estimator,
}

/// Side effects the controller applies after a pass
#[derive(Debug, Default)]
pub struct Outcome {
    /// Pods to create
    pub pods: Vec<Pod>,
    /// HTTP templates for the agent, keyed by node ID
    pub http_tasks: BTreeMap<String, Template>,
    /// Pods whose containers should be terminated
    pub terminate: Vec<String>,
    pub requeue_after: Option<Duration>,
}

#[derive(Debug, Clone)]
struct Halt {
    /// Phase given to nodes that had not started
    phase: NodePhase,
    message: String,
}

pub struct Operator<'a> {
    settings: &'a Settings,
    key: String,
    wf: Workflow,
    /// The workflow as pods see it: original metadata, effective spec
    exec_wf: Workflow,
    spec: WorkflowSpec,
    now: DateTime<Utc>,
    globals: BTreeMap<String, String>,
    pods: BTreeMap<String, Pod>,
    results: BTreeMap<String, WorkflowTaskResult>,
    task_set: Option<WorkflowTaskSet>,
    estimator: Estimator,
    halt: Option<Halt>,
    in_exit_handler: bool,
    active_pods: usize,
    outcome: Outcome,
}

impl<'a> Operator<'a> {
    pub fn new(settings: &'a Settings, wf: Workflow, inputs: OperatorInputs, now: DateTime<Utc>) -> Self {
        let mut exec_wf = wf.clone();
        exec_wf.spec = inputs.spec.clone();
        exec_wf.status = Default::default();
        let active_pods = wf
            .status
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Pod && !n.fulfilled())
            .count();
        Self {
            settings,
            key: wf.metadata.key(),
            exec_wf,
            spec: inputs.spec,
            now,
            globals: BTreeMap::new(),
            pods: inputs
                .pods
                .into_iter()
                .map(|p| (p.metadata.name.clone(), p))
                .collect(),
            results: inputs
                .task_results
                .into_iter()
                .map(|r| (r.metadata.name.clone(), r))
                .collect(),
            task_set: inputs.task_set,
            estimator: inputs.estimator,
            halt: None,
            in_exit_handler: false,
            active_pods,
            outcome: Outcome::default(),
            wf,
        }
    }

    /// Run one pass; returns the updated workflow and the side effects to apply
    pub fn operate(mut self) -> (Workflow, Outcome) {
        if self.wf.completed() {
            return self.finish();
        }
        if matches!(self.wf.status.phase, WorkflowPhase::Unknown | WorkflowPhase::Pending) {
            self.wf.status.phase = WorkflowPhase::Running;
            self.wf.status.message.clear();
            self.wf.status.started_at.get_or_insert(self.now);
            if self.wf.status.estimated_duration.is_none() {
                self.wf.status.estimated_duration = self.estimator.workflow_duration();
            }
            info!(workflow = %self.key, "workflow running");
        }
        self.set_phase_label();

        if let Err(e) = validate_workflow(&self.spec) {
            warn!(workflow = %self.key, "invalid workflow: {}", e);
            self.mark_workflow(WorkflowPhase::Failed, &e.message());
            return self.finish();
        }

        self.globals = self.build_globals();
        self.assess_nodes();
        self.collect_global_outputs();
        self.halt = self.halt_reason();
        self.halt_running_nodes();

        let Some(entry) = self.spec.template(&self.spec.entrypoint).cloned() else {
            let message = format!("entrypoint template '{}' not found", self.spec.entrypoint);
            self.mark_workflow(WorkflowPhase::Failed, &message);
            return self.finish();
        };
        let args = self.spec.arguments.clone();
        let name = self.wf.name().to_string();
        let root = self.execute_template(&name, &entry, &args, "");
        self.collect_global_outputs();
        let Some(root) = root.filter(NodeStatus::fulfilled) else {
            return self.finish();
        };

        let mut phase = root.phase;
        let mut message = if root.phase.failed_or_error() {
            root.message.clone()
        } else {
            String::new()
        };

        if let Some(exit) = self.exit_template() {
            self.globals.insert(
                "workflow.status".to_string(),
                WorkflowPhase::from(phase).as_str().to_string(),
            );
            self.globals
                .insert("workflow.failures".to_string(), self.failures().to_string());
            self.in_exit_handler = true;
            let exit_node = self.execute_template(&format!("{}.onExit", name), &exit, &args, "");
            self.in_exit_handler = false;
            let Some(exit_node) = exit_node.filter(NodeStatus::fulfilled) else {
                return self.finish();
            };
            if exit_node.phase.severity() > phase.severity() {
                phase = exit_node.phase;
                message = exit_node.message.clone();
            }
        }

        let mut phase = WorkflowPhase::from(phase);
        if let Some(halt) = &self.halt {
            if phase == WorkflowPhase::Succeeded {
                phase = WorkflowPhase::Failed;
                message = halt.message.clone();
            }
        }
        if root.outputs.is_some() {
            self.wf.status.outputs = root.outputs.clone();
        }
        self.mark_workflow(phase, &message);
        self.finish()
    }

    fn finish(mut self) -> (Workflow, Outcome) {
        if !self.wf.completed() {
            if let Some(deadline) = self.workflow_deadline().filter(|d| *d > self.now) {
                self.requeue((deadline - self.now).to_std().unwrap_or_default());
            }
        }
        self.update_progress();
        self.set_phase_label();
        (self.wf, self.outcome)
    }

    fn exit_template(&self) -> Option<Template> {
        if self.spec.on_exit.is_empty() || self.spec.shutdown == Some(ShutdownStrategy::Terminate) {
            return None;
        }
        self.spec.template(&self.spec.on_exit).cloned()
    }

    fn set_phase_label(&mut self) {
        let phase = self.wf.status.phase.as_str().to_string();
        if !phase.is_empty() {
            self.wf.metadata.labels.insert(LABEL_KEY_PHASE.to_string(), phase);
        }
    }

    fn mark_workflow(&mut self, phase: WorkflowPhase, message: &str) {
        let status = &mut self.wf.status;
        if status.phase != phase {
            info!(workflow = %self.key, phase = phase.as_str(), message, "workflow phase changed");
        }
        status.phase = phase;
        status.message = message.to_string();
        if phase.completed() {
            status.finished_at.get_or_insert(self.now);
            status.set_condition("Completed", "True", "");
        }
        self.set_phase_label();
    }

    fn update_progress(&mut self) {
        let (mut done, mut total) = (0u64, 0u64);
        for node in self.wf.status.nodes.iter().filter(|n| {
            matches!(
                n.node_type,
                NodeType::Pod | NodeType::Container | NodeType::Http | NodeType::Suspend
            )
        }) {
            let (d, t) = match parse_progress(&node.progress) {
                Some((_, t)) if node.succeeded() => (t, t),
                Some(progress) => progress,
                None if node.succeeded() => (1, 1),
                None => (0, 1),
            };
            done += d;
            total += t;
        }
        if total > 0 {
            self.wf.status.progress = format!("{}/{}", done, total);
        }
    }

    /// `workflow.*` variables visible to every template
    fn build_globals(&self) -> BTreeMap<String, String> {
        let wf = &self.wf;
        let mut globals = BTreeMap::new();
        globals.insert("workflow.name".to_string(), wf.name().to_string());
        globals.insert("workflow.namespace".to_string(), wf.namespace().to_string());
        globals.insert("workflow.uid".to_string(), wf.uid().to_string());
        globals.insert(
            "workflow.serviceAccountName".to_string(),
            self.spec.service_account_name.clone(),
        );
        if let Some(created) = wf.metadata.creation_timestamp {
            globals.insert("workflow.creationTimestamp".to_string(), created.to_rfc3339());
        }
        let mut params = Vec::new();
        for param in &self.spec.arguments.parameters {
            let value = param
                .value
                .clone()
                .or_else(|| param.default.clone())
                .unwrap_or_default();
            globals.insert(format!("workflow.parameters.{}", param.name), value.clone());
            params.push(json!({"name": param.name, "value": value}));
        }
        globals.insert("workflow.parameters".to_string(), Value::Array(params).to_string());
        for (key, value) in &wf.metadata.labels {
            globals.insert(format!("workflow.labels.{}", key), value.clone());
        }
        for (key, value) in &wf.metadata.annotations {
            globals.insert(format!("workflow.annotations.{}", key), value.clone());
        }
        for (key, value) in &wf.status.global_parameters {
            globals.insert(format!("workflow.outputs.parameters.{}", key), value.clone());
        }
        if let Some(started) = wf.status.started_at {
            let seconds = (self.now - started).num_milliseconds() as f64 / 1000.0;
            globals.insert("workflow.duration".to_string(), seconds.to_string());
        }
        globals
    }

    /// Failed leaf nodes, as exposed to exit handlers through `workflow.failures`
    fn failures(&self) -> Value {
        let failures: Vec<Value> = self
            .wf
            .status
            .nodes
            .iter()
            .filter(|n| n.phase.failed_or_error() && matches!(n.node_type, NodeType::Pod | NodeType::Http))
            .map(|n| {
                json!({
                    "displayName": n.display_name,
                    "message": n.message,
                    "templateName": n.template_name,
                    "phase": n.phase.as_str(),
                    "podName": n.id,
                    "finishedAt": n.finished_at.map(|t| t.to_rfc3339()),
                })
            })
            .collect();
        Value::Array(failures)
    }

    /// Export output parameters that carry a `globalName`
    fn collect_global_outputs(&mut self) {
        let mut exported = BTreeMap::new();
        for node in self.wf.status.nodes.iter().filter(|n| n.succeeded()) {
            let Some(outputs) = &node.outputs else {
                continue;
            };
            for param in outputs.parameters.iter().filter(|p| !p.global_name.is_empty()) {
                if let Some(value) = &param.value {
                    exported.insert(param.global_name.clone(), value.clone());
                }
            }
        }
        for (name, value) in exported {
            self.globals
                .insert(format!("workflow.outputs.parameters.{}", name), value.clone());
            self.wf.status.global_parameters.insert(name, value);
        }
    }

    fn workflow_deadline(&self) -> Option<DateTime<Utc>> {
        let seconds = self.spec.active_deadline_seconds?;
        Some(self.wf.status.started_at? + chrono::Duration::seconds(seconds))
    }

    fn halt_reason(&self) -> Option<Halt> {
        if let Some(strategy) = &self.spec.shutdown {
            return Some(Halt {
                phase: NodePhase::Skipped,
                message: format!("Stopped with strategy '{:?}'", strategy),
            });
        }
        let deadline = self.workflow_deadline()?;
        (self.now >= deadline).then(|| Halt {
            phase: NodePhase::Failed,
            message: "Step exceeded its deadline".to_string(),
        })
    }

    fn halted(&self) -> Option<Halt> {
        if self.in_exit_handler {
            None
        } else {
            self.halt.clone()
        }
    }

    /// Fail unfinished leaf nodes of the main graph and stop their pods
    fn halt_running_nodes(&mut self) {
        let Some(halt) = self.halt.clone() else {
            return;
        };
        let exit_prefix = format!("{}.onExit", self.wf.name());
        let ids: Vec<String> = self
            .wf
            .status
            .nodes
            .iter()
            .filter(|n| {
                !n.fulfilled()
                    && matches!(n.node_type, NodeType::Pod | NodeType::Http | NodeType::Suspend)
                    && !n.name.starts_with(&exit_prefix)
            })
            .map(|n| n.id.clone())
            .collect();
        for id in ids {
            let running = self
                .pods
                .get(&id)
                .map(|p| !p.status.phase.is_completed())
                .unwrap_or(false);
            if running {
                self.outcome.terminate.push(id.clone());
            }
            self.mark_node(&id, NodePhase::Failed, &halt.message);
        }
    }

    fn requeue(&mut self, after: Duration) {
        let after = after.max(Duration::from_secs(1));
        self.outcome.requeue_after = Some(match self.outcome.requeue_after {
            Some(current) => current.min(after),
            None => after,
        });
    }

    fn id(&self, name: &str) -> String {
        node_id(self.wf.name(), name)
    }

    fn node(&self, name: &str) -> Option<&NodeStatus> {
        self.wf.status.nodes.get(&self.id(name))
    }

    fn node_by_id(&self, id: &str) -> Option<NodeStatus> {
        self.wf.status.nodes.get(id).cloned()
    }

    /// Create the node called `name` unless it already exists
    fn init_node(
        &mut self,
        name: &str,
        node_type: NodeType,
        template: Option<&Template>,
        boundary_id: &str,
        phase: NodePhase,
        message: &str,
    ) -> NodeStatus {
        let id = self.id(name);
        if let Some(existing) = self.wf.status.nodes.get(&id) {
            return existing.clone();
        }
        let mut node = NodeStatus {
            id,
            name: name.to_string(),
            display_name: display_name(name),
            node_type,
            template_name: template.map(|t| t.name.clone()).unwrap_or_default(),
            boundary_id: boundary_id.to_string(),
            started_at: Some(self.now),
            estimated_duration: self.estimator.node_duration(self.wf.name(), name),
            inputs: template.map(|t| t.inputs.clone()).filter(|i| !i.is_empty()),
            ..Default::default()
        };
        node.mark_phase(phase, message, self.now);
        debug!(workflow = %self.key, node = name, phase = node.phase.as_str(), "node initialized");
        self.wf.status.nodes.insert(node.clone());
        node
    }

    fn mark_node(&mut self, id: &str, phase: NodePhase, message: &str) -> Option<NodeStatus> {
        let node = self.wf.status.nodes.get_mut(id)?;
        if node.mark_phase(phase, message, self.now) {
            info!(
                workflow = %self.key,
                node = %node.name,
                phase = phase.as_str(),
                message,
                "node phase changed"
            );
        }
        Some(node.clone())
    }

    fn skip_node(&mut self, name: &str, template_name: &str, boundary_id: &str, message: &str) -> NodeStatus {
        let template = Template {
            name: template_name.to_string(),
            ..Default::default()
        };
        self.init_node(
            name,
            NodeType::Skipped,
            Some(&template),
            boundary_id,
            NodePhase::Skipped,
            message,
        )
    }

    fn resolve_template(&self, name: &str, inline: Option<&Template>) -> Result<Template, WfError> {
        if let Some(inline) = inline {
            return Ok(inline.clone());
        }
        self.spec
            .template(name)
            .cloned()
            .ok_or_else(|| WfError::BadRequest(format!("template '{}' not found", name)))
    }

    /// Substitute scope variables into a step or task and resolve its artifact `from` references
    fn resolve_references<T: Expandable>(&self, item: &T, scope: &Scope) -> Result<T, WfError> {
        let mut resolved: T = template::replace_struct(item, scope.params(), true)?;
        let args = resolved.arguments_mut();
        let mut artifacts = Vec::with_capacity(args.artifacts.len());
        for artifact in args.artifacts.drain(..) {
            if artifact.from.is_empty() {
                artifacts.push(artifact);
                continue;
            }
            match scope.resolve_artifact(&artifact.from) {
                Ok(found) => artifacts.push(Artifact {
                    name: artifact.name,
                    optional: artifact.optional,
                    from: String::new(),
                    ..found
                }),
                Err(_) if artifact.optional => {}
                Err(e) => return Err(e),
            }
        }
        args.artifacts = artifacts;
        Ok(resolved)
    }

    /// Bind arguments to the template's inputs and substitute everything the template can see
    fn process_inputs(
        &self,
        name: &str,
        template: &Template,
        args: &Arguments,
        retries: Option<usize>,
    ) -> Result<Template, WfError> {
        let mut tmpl = template.clone();
        let mut vars = self.globals.clone();
        for param in tmpl.inputs.parameters.iter_mut() {
            let supplied = args.parameter(&param.name).and_then(|p| p.value.clone());
            let value = supplied
                .or_else(|| param.value.clone())
                .or_else(|| param.default.clone())
                .ok_or_else(|| {
                    WfError::BadRequest(format!("inputs.parameters.{} was not supplied", param.name))
                })?;
            let value = template::replace_str(&value, &self.globals, true)?;
            if !param.enum_values.is_empty() && !param.enum_values.contains(&value) {
                return Err(WfError::BadRequest(format!(
                    "value '{}' is not valid for inputs.parameters.{}; valid values are: {}",
                    value,
                    param.name,
                    param.enum_values.join(", ")
                )));
            }
            vars.insert(format!("inputs.parameters.{}", param.name), value.clone());
            param.value = Some(value);
        }
        for artifact in tmpl.inputs.artifacts.iter_mut() {
            if let Some(arg) = args.artifact(&artifact.name).filter(|a| a.has_location()) {
                artifact.location = arg.location.clone();
                if artifact.archive.is_none() {
                    artifact.archive = arg.archive.clone();
                }
            }
            if !artifact.has_location() && !artifact.optional {
                return Err(WfError::BadRequest(format!(
                    "inputs.artifacts.{} was not supplied",
                    artifact.name
                )));
            }
        }
        vars.insert("node.name".to_string(), name.to_string());
        if tmpl.is_pod_type() {
            vars.insert("pod.name".to_string(), self.id(name));
        }
        if let Some(attempt) = retries {
            vars.insert("retries".to_string(), attempt.to_string());
        }
        template::replace_struct(&tmpl, &vars, true)
    }

    /// Run `template` as node `name`; `None` means it could not start yet
    fn execute_template(
        &mut self,
        name: &str,
        template: &Template,
        args: &Arguments,
        boundary_id: &str,
    ) -> Option<NodeStatus> {
        if let Some(node) = self.node(name).filter(|n| n.fulfilled()) {
            return Some(node.clone());
        }
        match self.try_execute(name, template, args, boundary_id) {
            Ok(node) => node,
            Err(e) => {
                warn!(workflow = %self.key, node = name, "template execution failed: {}", e);
                let message = e.message();
                let node = self.init_node(
                    name,
                    node_type_for(template),
                    Some(template),
                    boundary_id,
                    NodePhase::Error,
                    &message,
                );
                self.mark_node(&node.id, NodePhase::Error, &message)
            }
        }
    }

    fn try_execute(
        &mut self,
        name: &str,
        template: &Template,
        args: &Arguments,
        boundary_id: &str,
    ) -> Result<Option<NodeStatus>, WfError> {
        match template.retry_strategy.clone() {
            Some(strategy) => self.execute_with_retries(name, template, args, &strategy, boundary_id),
            None => {
                let resolved = self.process_inputs(name, template, args, None)?;
                self.run_template(name, &resolved, boundary_id)
            }
        }
    }

    fn execute_with_retries(
        &mut self,
        name: &str,
        template: &Template,
        args: &Arguments,
        strategy: &RetryStrategy,
        boundary_id: &str,
    ) -> Result<Option<NodeStatus>, WfError> {
        let retry = self.init_node(
            name,
            NodeType::Retry,
            Some(template),
            boundary_id,
            NodePhase::Running,
            "",
        );
        let limit = match &strategy.limit {
            Some(limit) => Some(
                limit
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| WfError::BadRequest(format!("invalid retry limit '{}'", limit)))?,
            ),
            None => None,
        };
        for _ in 0..MAX_ATTEMPTS_PER_PASS {
            let attempts: Vec<NodeStatus> = self
                .wf
                .status
                .nodes
                .children(&retry.id)
                .into_iter()
                .cloned()
                .collect();
            let attempt = match attempts.last() {
                None => 0,
                Some(last) if !last.fulfilled() => attempts.len() - 1,
                Some(_) => {
                    if let Some(done) = self.conclude_retries(&retry.id, &attempts, strategy, limit)? {
                        return Ok(Some(done));
                    }
                    if let Some(node) = self.wf.status.nodes.get_mut(&retry.id) {
                        node.message.clear();
                    }
                    attempts.len()
                }
            };
            let node = self.run_attempt(name, template, args, attempt, &retry.id, boundary_id)?;
            if !node.map(|n| n.fulfilled()).unwrap_or(false) {
                return Ok(self.node_by_id(&retry.id));
            }
        }
        self.requeue(Duration::from_secs(1));
        Ok(self.node_by_id(&retry.id))
    }

    /// Decide whether the retry node is finished or waiting; `None` starts the next attempt
    fn conclude_retries(
        &mut self,
        retry_id: &str,
        attempts: &[NodeStatus],
        strategy: &RetryStrategy,
        limit: Option<usize>,
    ) -> Result<Option<NodeStatus>, WfError> {
        let Some(last) = attempts.last() else {
            return Ok(None);
        };
        if matches!(last.phase, NodePhase::Succeeded | NodePhase::Skipped) {
            if let Some(node) = self.wf.status.nodes.get_mut(retry_id) {
                node.outputs = last.outputs.clone();
            }
            return Ok(self.mark_node(retry_id, last.phase, &last.message));
        }
        if let Some(halt) = self.halted() {
            return Ok(self.mark_node(retry_id, last.phase, &halt.message));
        }
        let retryable = match strategy.retry_policy.unwrap_or_default() {
            RetryPolicy::Always => true,
            RetryPolicy::OnFailure => last.phase == NodePhase::Failed,
            RetryPolicy::OnError | RetryPolicy::OnTransientError => last.phase == NodePhase::Error,
        };
        if !retryable {
            return Ok(self.mark_node(retry_id, last.phase, &last.message));
        }
        if limit.map(|l| attempts.len() > l).unwrap_or(false) {
            return Ok(self.mark_node(retry_id, last.phase, "No more retries left"));
        }
        let Some(backoff) = &strategy.backoff else {
            return Ok(None);
        };
        if let Some(max) = &backoff.max_duration {
            let max = to_chrono(parse_duration(max)?);
            let first_started = attempts[0].started_at.unwrap_or(self.now);
            if self.now - first_started >= max {
                return Ok(self.mark_node(retry_id, last.phase, "Max duration limit exceeded"));
            }
        }
        let delay = backoff_delay(backoff, attempts.len())?;
        let ready_at = last.finished_at.unwrap_or(self.now) + to_chrono(delay);
        if ready_at <= self.now {
            return Ok(None);
        }
        let wait = (ready_at - self.now).to_std().unwrap_or_default();
        self.requeue(wait);
        if let Some(node) = self.wf.status.nodes.get_mut(retry_id) {
            node.message = format!("Backoff for {}", format_duration(wait));
        }
        Ok(self.node_by_id(retry_id))
    }

    fn run_attempt(
        &mut self,
        name: &str,
        template: &Template,
        args: &Arguments,
        attempt: usize,
        retry_id: &str,
        boundary_id: &str,
    ) -> Result<Option<NodeStatus>, WfError> {
        let attempt_name = format!("{}({})", name, attempt);
        if let Some(node) = self.node(&attempt_name).filter(|n| n.fulfilled()) {
            return Ok(Some(node.clone()));
        }
        let mut resolved = self.process_inputs(&attempt_name, template, args, Some(attempt))?;
        resolved.retry_strategy = None;
        let node = self.run_template(&attempt_name, &resolved, boundary_id)?;
        if let Some(node) = &node {
            self.wf.status.nodes.add_child(retry_id, &node.id);
        }
        Ok(node)
    }

    /// Dispatch a fully resolved template on its type
    fn run_template(
        &mut self,
        name: &str,
        template: &Template,
        boundary_id: &str,
    ) -> Result<Option<NodeStatus>, WfError> {
        let template_type = template.template_type().map_err(WfError::BadRequest)?;
        if template.is_leaf() && self.node(name).is_none() {
            if let Some(halt) = self.halted() {
                let node = self.init_node(
                    name,
                    node_type_for(template),
                    Some(template),
                    boundary_id,
                    halt.phase,
                    &halt.message,
                );
                return Ok(Some(node));
            }
        }
        match template_type {
            TemplateType::Container
            | TemplateType::Script
            | TemplateType::Resource
            | TemplateType::Data
            | TemplateType::ContainerSet => self.execute_pod(name, template, boundary_id),
            TemplateType::Http => Ok(Some(self.execute_http(name, template, boundary_id))),
            TemplateType::Suspend => self.execute_suspend(name, template, boundary_id).map(Some),
            TemplateType::Steps => self.execute_steps(name, template, boundary_id).map(Some),
            TemplateType::Dag => self.execute_dag(name, template, boundary_id).map(Some),
        }
    }

    fn execute_pod(
        &mut self,
        name: &str,
        template: &Template,
        boundary_id: &str,
    ) -> Result<Option<NodeStatus>, WfError> {
        let id = self.id(name);
        match self.node_by_id(&id) {
            Some(node) => {
                let pod_known = self.pods.contains_key(&id)
                    || self.outcome.pods.iter().any(|p| p.metadata.name == id);
                if node.fulfilled() || pod_known || node.phase != NodePhase::Pending {
                    return Ok(Some(node));
                }
                debug!(workflow = %self.key, node = name, "recreating missing pod");
            }
            None => {
                if let Some(limit) = self.spec.parallelism {
                    if self.active_pods >= limit {
                        debug!(workflow = %self.key, node = name, limit, "parallelism limit reached");
                        return Ok(None);
                    }
                }
            }
        }
        let node = self.init_node(
            name,
            NodeType::Pod,
            Some(template),
            boundary_id,
            NodePhase::Pending,
            "",
        );
        let template_deadline = template
            .active_deadline_seconds
            .map(|s| self.now + chrono::Duration::seconds(s));
        let deadline = match (self.workflow_deadline(), template_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let pod = build_pod(
            self.settings,
            &PodRequest {
                wf: &self.exec_wf,
                node_id: &node.id,
                node_name: name,
                template,
                deadline,
            },
        )?;
        info!(workflow = %self.key, node = name, pod = %pod.metadata.name, "creating pod");
        self.outcome.pods.push(pod);
        self.active_pods += 1;
        Ok(Some(node))
    }

    fn execute_http(&mut self, name: &str, template: &Template, boundary_id: &str) -> NodeStatus {
        let node = self.init_node(
            name,
            NodeType::Http,
            Some(template),
            boundary_id,
            NodePhase::Pending,
            "",
        );
        if !node.fulfilled() {
            self.outcome.http_tasks.insert(node.id.clone(), template.clone());
        }
        node
    }

    fn execute_suspend(
        &mut self,
        name: &str,
        template: &Template,
        boundary_id: &str,
    ) -> Result<NodeStatus, WfError> {
        let node = self.init_node(
            name,
            NodeType::Suspend,
            Some(template),
            boundary_id,
            NodePhase::Running,
            "",
        );
        let duration = template.suspend.as_ref().and_then(|s| s.duration.clone());
        let Some(duration) = duration.filter(|_| !node.fulfilled()) else {
            return Ok(node);
        };
        let resume_at = node.started_at.unwrap_or(self.now) + to_chrono(parse_duration(&duration)?);
        if self.now >= resume_at {
            return Ok(self
                .mark_node(&node.id, NodePhase::Succeeded, "")
                .unwrap_or(node));
        }
        self.requeue((resume_at - self.now).to_std().unwrap_or_default());
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use workflow_api::ObjectMeta;

    fn workflow(spec: serde_json::Value) -> Workflow {
        Workflow {
            metadata: ObjectMeta::named("argo", "hello"),
            spec: serde_json::from_value(spec).unwrap(),
            ..Default::default()
        }
    }

    fn run(settings: &Settings, wf: Workflow, pods: Vec<Pod>) -> (Workflow, Outcome) {
        let inputs = OperatorInputs {
            spec: wf.spec.clone(),
            pods,
            ..Default::default()
        };
        Operator::new(settings, wf, inputs, Utc::now()).operate()
    }

    #[test]
    fn test_node_names() {
        assert_eq!(node_id("wf", "wf"), "wf");
        assert_eq!(node_id("wf", "wf.a"), format!("wf-{}", fnv32a(b"wf.a")));
        assert_eq!(display_name("wf[0].print(1:a.b)"), "print(1:a.b)");
        assert_eq!(display_name("wf.dag.task"), "task");
        assert_eq!(display_name("wf"), "wf");
    }

    #[test]
    fn test_backoff_delay() {
        let backoff = Backoff {
            duration: Some("2s".to_string()),
            factor: Some(2.0),
            max_duration: Some("5s".to_string()),
        };
        assert_eq!(backoff_delay(&backoff, 1).unwrap(), Duration::from_secs(2));
        assert_eq!(backoff_delay(&backoff, 2).unwrap(), Duration::from_secs(4));
        assert_eq!(backoff_delay(&backoff, 3).unwrap(), Duration::from_secs(5));
        assert_eq!(backoff_delay(&Backoff::default(), 3).unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_first_pass_creates_root_pod() {
        let settings = Settings::default();
        let wf = workflow(json!({
            "entrypoint": "main",
            "arguments": {"parameters": [{"name": "msg", "value": "hi"}]},
            "templates": [{
                "name": "main",
                "inputs": {"parameters": [{"name": "msg"}]},
                "container": {"image": "alpine", "command": ["echo"], "args": ["{{inputs.parameters.msg}}"]}
            }]
        }));
        let (wf, outcome) = run(&settings, wf, Vec::new());
        assert_eq!(wf.status.phase, WorkflowPhase::Running);
        assert_eq!(wf.metadata.labels[LABEL_KEY_PHASE], "Running");
        assert_eq!(outcome.pods.len(), 1);
        assert_eq!(outcome.pods[0].metadata.name, "hello");
        let root = wf.status.nodes.get("hello").unwrap();
        assert_eq!(root.phase, NodePhase::Pending);
        assert_eq!(root.inputs.as_ref().unwrap().parameters[0].value.as_deref(), Some("hi"));
        assert_eq!(wf.status.progress, "0/1");
    }

    #[test]
    fn test_missing_parameter_errors_node() {
        let settings = Settings::default();
        let wf = workflow(json!({
            "entrypoint": "main",
            "templates": [{
                "name": "main",
                "inputs": {"parameters": [{"name": "msg"}]},
                "container": {"image": "alpine", "command": ["echo"]}
            }]
        }));
        let (wf, outcome) = run(&settings, wf, Vec::new());
        assert!(outcome.pods.is_empty());
        assert_eq!(wf.status.phase, WorkflowPhase::Error);
        assert_eq!(wf.status.message, "inputs.parameters.msg was not supplied");
        assert!(wf.status.finished_at.is_some());
    }

    #[test]
    fn test_invalid_spec_fails_workflow() {
        let settings = Settings::default();
        let wf = workflow(json!({"entrypoint": "missing", "templates": []}));
        let (wf, _) = run(&settings, wf, Vec::new());
        assert_eq!(wf.status.phase, WorkflowPhase::Failed);
        assert!(!wf.status.message.is_empty());
    }

    #[test]
    fn test_suspend_resumes_after_duration() {
        let settings = Settings::default();
        let mut wf = workflow(json!({
            "entrypoint": "wait",
            "templates": [{"name": "wait", "suspend": {"duration": "30s"}}]
        }));
        let (next, outcome) = run(&settings, wf.clone(), Vec::new());
        assert_eq!(next.status.nodes.get("hello").unwrap().phase, NodePhase::Running);
        assert!(outcome.requeue_after.unwrap() <= Duration::from_secs(30));

        wf.status = next.status;
        let later = Utc::now() + chrono::Duration::seconds(31);
        let inputs = OperatorInputs {
            spec: wf.spec.clone(),
            ..Default::default()
        };
        let (done, _) = Operator::new(&settings, wf, inputs, later).operate();
        assert_eq!(done.status.phase, WorkflowPhase::Succeeded);
    }
}
