//! Sequential groups of parallel steps

use tracing::warn;
use workflow_api::template::ContinueOn;
use workflow_api::{NodePhase, NodeStatus, NodeType, Template, WorkflowStep};

use super::expand::{expand, Expandable};
use super::Operator;
use crate::controller::scope::Scope;
use crate::errors::WfError;
use crate::template::should_execute;

/// Whether `continueOn` lets the parent proceed past a child in `phase`
pub(super) fn continues(continue_on: Option<&ContinueOn>, phase: NodePhase) -> bool {
    let Some(continue_on) = continue_on else {
        return false;
    };
    match phase {
        NodePhase::Failed => continue_on.failed,
        NodePhase::Error => continue_on.error,
        _ => false,
    }
}

/// Scope seeded with the template's input artifacts, for `from: {{inputs.artifacts.x}}`
pub(super) fn template_scope(op: &Operator<'_>, template: &Template) -> Scope {
    let mut scope = Scope::new(&op.globals);
    for artifact in template.inputs.artifacts.iter().filter(|a| a.has_location()) {
        scope.add_artifact(&format!("inputs.artifacts.{}", artifact.name), artifact.clone());
    }
    scope
}

impl Operator<'_> {
    pub(super) fn execute_steps(
        &mut self,
        name: &str,
        template: &Template,
        boundary_id: &str,
    ) -> Result<NodeStatus, WfError> {
        let node = self.init_node(
            name,
            NodeType::Steps,
            Some(template),
            boundary_id,
            NodePhase::Running,
            "",
        );
        if node.fulfilled() {
            return Ok(node);
        }
        let mut scope = template_scope(self, template);
        let groups = template.steps.clone().unwrap_or_default();
        for (index, group) in groups.iter().enumerate() {
            let group_name = format!("{}[{}]", name, index);
            let group_node = self.execute_step_group(&group_name, group, &node.id, &scope);
            self.wf.status.nodes.add_child(&node.id, &group_node.id);
            if !group_node.fulfilled() {
                return Ok(self.node_by_id(&node.id).unwrap_or(node));
            }
            if group_node.phase.failed_or_error() {
                return Ok(self
                    .mark_node(&node.id, group_node.phase, &group_node.message)
                    .unwrap_or(node));
            }
            self.add_group_outputs(&group_name, group, &mut scope);
        }
        let outputs = scope.resolve_outputs(&template.outputs)?;
        if let Some(current) = self.wf.status.nodes.get_mut(&node.id) {
            current.outputs = outputs;
        }
        Ok(self
            .mark_node(&node.id, NodePhase::Succeeded, "")
            .unwrap_or(node))
    }

    fn execute_step_group(
        &mut self,
        group_name: &str,
        steps: &[WorkflowStep],
        steps_id: &str,
        scope: &Scope,
    ) -> NodeStatus {
        let group = self.init_node(
            group_name,
            NodeType::StepGroup,
            None,
            steps_id,
            NodePhase::Running,
            "",
        );
        if group.fulfilled() {
            return group;
        }
        let mut children: Vec<(Option<NodeStatus>, Option<ContinueOn>)> = Vec::new();
        for step in steps {
            match self.execute_step(group_name, &group.id, steps_id, step, scope) {
                Ok(nodes) => {
                    children.extend(nodes.into_iter().map(|n| (n, step.continue_on.clone())));
                }
                Err(e) => {
                    warn!(workflow = %self.key, group = group_name, step = %step.name, "step failed: {}", e);
                    return self
                        .mark_node(&group.id, NodePhase::Error, &e.message())
                        .unwrap_or(group);
                }
            }
        }
        if children
            .iter()
            .any(|(node, _)| !node.as_ref().map(|n| n.fulfilled()).unwrap_or(false))
        {
            return group;
        }
        let failed = children.iter().find_map(|(node, continue_on)| {
            node.as_ref()
                .filter(|n| n.phase.failed_or_error() && !continues(continue_on.as_ref(), n.phase))
        });
        let marked = match failed {
            Some(child) => {
                let message = format!("child '{}' failed", child.id);
                self.mark_node(&group.id, NodePhase::Failed, &message)
            }
            None => self.mark_node(&group.id, NodePhase::Succeeded, ""),
        };
        marked.unwrap_or(group)
    }

    /// Run one step of a group, fanned out if it has items; `None` entries could not start
    fn execute_step(
        &mut self,
        group_name: &str,
        group_id: &str,
        steps_id: &str,
        step: &WorkflowStep,
        scope: &Scope,
    ) -> Result<Vec<Option<NodeStatus>>, WfError> {
        let step_name = format!("{}.{}", group_name, step.name);
        if let Some(node) = self.node(&step_name).filter(|n| n.fulfilled()) {
            return Ok(vec![Some(node.clone())]);
        }
        let resolved = self.resolve_references(step, scope)?;
        let expanded = expand(&resolved)?;
        if expanded.is_empty() {
            let node = self.skip_node(&step_name, &step.template, steps_id, "Skipped, empty params");
            self.wf.status.nodes.add_child(group_id, &node.id);
            return Ok(vec![Some(node)]);
        }
        let mut nodes = Vec::with_capacity(expanded.len());
        for child in expanded {
            let child_name = format!("{}.{}", group_name, child.name);
            if let Some(node) = self.node(&child_name).filter(|n| n.fulfilled()) {
                nodes.push(Some(node.clone()));
                continue;
            }
            if self.node(&child_name).is_none() && !child.when.is_empty() {
                match should_execute(&child.when) {
                    Ok(true) => {}
                    Ok(false) => {
                        let message = format!("when '{}' evaluated false", child.when);
                        let node = self.skip_node(&child_name, &child.template, steps_id, &message);
                        self.wf.status.nodes.add_child(group_id, &node.id);
                        nodes.push(Some(node));
                        continue;
                    }
                    Err(e) => {
                        let node = self.init_node(
                            &child_name,
                            NodeType::Skipped,
                            None,
                            steps_id,
                            NodePhase::Error,
                            &e.message(),
                        );
                        self.wf.status.nodes.add_child(group_id, &node.id);
                        return Err(e);
                    }
                }
            }
            let (template_name, inline) = child.template_ref();
            let template = self.resolve_template(template_name, inline)?;
            let node = self.execute_template(&child_name, &template, child.arguments(), steps_id);
            if let Some(node) = &node {
                self.wf.status.nodes.add_child(group_id, &node.id);
            }
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Publish a finished group's outputs as `steps.<name>.*`
    fn add_group_outputs(&self, group_name: &str, steps: &[WorkflowStep], scope: &mut Scope) {
        let group_id = self.id(group_name);
        for step in steps {
            let child_name = format!("{}.{}", group_name, step.name);
            let prefix = format!("steps.{}", step.name);
            if step.is_expanded() {
                let marker = format!("{}(", child_name);
                let children: Vec<&NodeStatus> = self
                    .wf
                    .status
                    .nodes
                    .children(&group_id)
                    .into_iter()
                    .filter(|n| n.name.starts_with(&marker) && n.phase != NodePhase::Skipped)
                    .collect();
                scope.add_aggregated_outputs(&prefix, &children);
            } else if let Some(node) = self.node(&child_name) {
                scope.add_node_outputs(&prefix, node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::operator::{OperatorInputs, Outcome};
    use crate::storage::settings::Settings;
    use chrono::Utc;
    use serde_json::json;
    use workflow_api::{ObjectMeta, Pod, PodPhase, Workflow, WorkflowPhase};

    fn run(settings: &Settings, wf: &Workflow, pods: Vec<Pod>) -> (Workflow, Outcome) {
        let inputs = OperatorInputs {
            spec: wf.spec.clone(),
            pods,
            ..Default::default()
        };
        Operator::new(settings, wf.clone(), inputs, Utc::now()).operate()
    }

    fn finish(mut pod: Pod, phase: PodPhase) -> Pod {
        pod.status.phase = phase;
        pod
    }

    #[test]
    fn test_continues() {
        let on = ContinueOn {
            failed: true,
            error: false,
        };
        assert!(continues(Some(&on), NodePhase::Failed));
        assert!(!continues(Some(&on), NodePhase::Error));
        assert!(!continues(None, NodePhase::Failed));
    }

    #[test]
    fn test_groups_run_in_order() {
        let settings = Settings::default();
        let mut wf = Workflow {
            metadata: ObjectMeta::named("argo", "seq"),
            spec: serde_json::from_value(json!({
                "entrypoint": "main",
                "templates": [
                    {"name": "main", "steps": [
                        [{"name": "a", "template": "echo"}],
                        [{"name": "b", "template": "echo", "when": "1 == 2"},
                         {"name": "c", "template": "echo", "withItems": [1, 2]}]
                    ]},
                    {"name": "echo", "container": {"image": "alpine", "command": ["echo"]}}
                ]
            }))
            .unwrap(),
            ..Default::default()
        };

        let (next, outcome) = run(&settings, &wf, Vec::new());
        assert_eq!(outcome.pods.len(), 1);
        assert_eq!(outcome.pods[0].metadata.annotations[workflow_api::common::ANNOTATION_KEY_NODE_NAME], "seq[0].a");
        wf.status = next.status;

        let pod_a = finish(outcome.pods[0].clone(), PodPhase::Succeeded);
        let (next, outcome) = run(&settings, &wf, vec![pod_a.clone()]);
        let names: Vec<String> = outcome
            .pods
            .iter()
            .map(|p| p.metadata.annotations[workflow_api::common::ANNOTATION_KEY_NODE_NAME].clone())
            .collect();
        assert_eq!(names, vec!["seq[1].c(0:1)", "seq[1].c(1:2)"]);
        let skipped = next.status.nodes.find_by_name("seq[1].b").unwrap();
        assert_eq!(skipped.phase, NodePhase::Skipped);
        assert_eq!(skipped.message, "when '1 == 2' evaluated false");
        wf.status = next.status;

        let mut pods = vec![pod_a];
        pods.extend(outcome.pods.into_iter().map(|p| finish(p, PodPhase::Succeeded)));
        let (done, _) = run(&settings, &wf, pods);
        assert_eq!(done.status.phase, WorkflowPhase::Succeeded);
        assert_eq!(done.status.nodes.find_by_name("seq[1]").unwrap().phase, NodePhase::Succeeded);
    }

    #[test]
    fn test_failed_step_fails_group() {
        let settings = Settings::default();
        let mut wf = Workflow {
            metadata: ObjectMeta::named("argo", "fail"),
            spec: serde_json::from_value(json!({
                "entrypoint": "main",
                "templates": [
                    {"name": "main", "steps": [
                        [{"name": "a", "template": "echo"}],
                        [{"name": "b", "template": "echo"}]
                    ]},
                    {"name": "echo", "container": {"image": "alpine", "command": ["echo"]}}
                ]
            }))
            .unwrap(),
            ..Default::default()
        };
        let (next, outcome) = run(&settings, &wf, Vec::new());
        wf.status = next.status;
        let failed = finish(outcome.pods[0].clone(), PodPhase::Failed);
        let (done, outcome) = run(&settings, &wf, vec![failed]);
        assert!(outcome.pods.is_empty());
        assert_eq!(done.status.phase, WorkflowPhase::Failed);
        let a = done.status.nodes.find_by_name("fail[0].a").unwrap();
        assert_eq!(
            done.status.nodes.find_by_name("fail[0]").unwrap().message,
            format!("child '{}' failed", a.id)
        );
        assert!(done.status.nodes.find_by_name("fail[1]").is_none());
    }
}
