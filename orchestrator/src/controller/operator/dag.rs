//! DAG templates: tasks run once their `depends` expression can be decided

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::warn;
use workflow_api::{DagTask, DagTemplate, NodePhase, NodeStatus, NodeType, Template};

use super::expand::{expand, Expandable};
use super::steps::{continues, template_scope};
use super::Operator;
use crate::controller::depends::{self, Depends, TaskResult};
use crate::controller::scope::Scope;
use crate::controller::validate::task_dependencies;
use crate::errors::WfError;
use crate::template::should_execute;

/// Message prefix of tasks skipped because their `depends` evaluated false
const OMITTED: &str = "omitted";

fn omitted(node: &NodeStatus) -> bool {
    node.phase == NodePhase::Skipped && node.message.starts_with(OMITTED)
}

/// Whether a single node satisfies `result`; `None` is the bare form
fn node_matches(node: &NodeStatus, result: Option<TaskResult>) -> bool {
    let daemoned = node.daemoned.unwrap_or(false);
    match result {
        None => node.succeeded() || (node.phase == NodePhase::Skipped && !omitted(node)) || daemoned,
        Some(TaskResult::Succeeded) => node.succeeded(),
        Some(TaskResult::Failed) => node.phase == NodePhase::Failed,
        Some(TaskResult::Errored) => node.phase == NodePhase::Error,
        Some(TaskResult::Skipped) => node.phase == NodePhase::Skipped && !omitted(node),
        Some(TaskResult::Omitted) => omitted(node),
        Some(TaskResult::Completed) => matches!(node.phase, NodePhase::Succeeded | NodePhase::Failed),
        Some(TaskResult::Any) => node.fulfilled(),
        Some(TaskResult::Daemoned) => daemoned,
        Some(TaskResult::AnySucceeded) => node.succeeded(),
        Some(TaskResult::AllFailed) => node.phase == NodePhase::Failed,
    }
}

/// Everything the walk needs to know about one DAG template
struct Dag {
    node_name: String,
    node_id: String,
    template: DagTemplate,
    deps: BTreeMap<String, Vec<String>>,
    depends: BTreeMap<String, Depends>,
    fail_fast: bool,
}

impl Dag {
    fn new(node: &NodeStatus, template: DagTemplate) -> Result<Self, WfError> {
        let deps = task_dependencies(&template)?;
        let mut parsed = BTreeMap::new();
        for task in &template.tasks {
            let text = if !task.depends.is_empty() {
                task.depends.clone()
            } else {
                depends::from_dependencies(&task.dependencies, |dep| {
                    template
                        .task(dep)
                        .and_then(|t| t.continue_on.as_ref())
                        .map(|c| (c.failed, c.error))
                        .unwrap_or((false, false))
                })
            };
            if !text.is_empty() {
                parsed.insert(task.name.clone(), depends::parse(&text)?);
            }
        }
        Ok(Self {
            node_name: node.name.clone(),
            node_id: node.id.clone(),
            fail_fast: template.fail_fast.unwrap_or(true),
            deps,
            depends: parsed,
            template,
        })
    }

    fn task_node_name(&self, task: &str) -> String {
        format!("{}.{}", self.node_name, task)
    }

    fn deps_of(&self, task: &str) -> &[String] {
        self.deps.get(task).map(Vec::as_slice).unwrap_or_default()
    }

    /// `target` tasks, or every task nothing else depends on
    fn targets(&self) -> Result<Vec<String>, WfError> {
        if !self.template.target.trim().is_empty() {
            let targets: Vec<String> = self
                .template
                .target
                .split_whitespace()
                .map(str::to_string)
                .collect();
            for target in &targets {
                if self.template.task(target).is_none() {
                    return Err(WfError::BadRequest(format!(
                        "target '{}' is not a task of the DAG",
                        target
                    )));
                }
            }
            return Ok(targets);
        }
        let depended: BTreeSet<&String> = self.deps.values().flatten().collect();
        Ok(self
            .template
            .tasks
            .iter()
            .map(|t| &t.name)
            .filter(|name| !depended.contains(name))
            .cloned()
            .collect())
    }

    /// Transitive dependencies of `task`
    fn ancestors(&self, task: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.deps_of(task).iter().map(String::as_str).collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.to_string()) {
                queue.extend(self.deps_of(next).iter().map(String::as_str));
            }
        }
        seen.into_iter().collect()
    }
}

impl Operator<'_> {
    pub(super) fn execute_dag(
        &mut self,
        name: &str,
        template: &Template,
        boundary_id: &str,
    ) -> Result<NodeStatus, WfError> {
        let node = self.init_node(
            name,
            NodeType::Dag,
            Some(template),
            boundary_id,
            NodePhase::Running,
            "",
        );
        if node.fulfilled() {
            return Ok(node);
        }
        let dag = Dag::new(&node, template.dag.clone().unwrap_or_default())?;
        let targets = dag.targets()?;
        let base_scope = template_scope(self, template);
        let mut visited = BTreeSet::new();
        for target in &targets {
            self.execute_dag_task(&dag, &base_scope, target, &mut visited);
        }

        let Some((phase, message)) = self.assess_dag_phase(&dag, &targets) else {
            return Ok(self.node_by_id(&node.id).unwrap_or(node));
        };
        if phase == NodePhase::Succeeded {
            let all: Vec<String> = dag.template.tasks.iter().map(|t| t.name.clone()).collect();
            let scope = self.dag_scope(&dag, &base_scope, &all);
            let outputs = scope.resolve_outputs(&template.outputs)?;
            if let Some(current) = self.wf.status.nodes.get_mut(&node.id) {
                current.outputs = outputs;
            }
        }
        Ok(self.mark_node(&node.id, phase, &message).unwrap_or(node))
    }

    fn execute_dag_task(&mut self, dag: &Dag, base: &Scope, task_name: &str, visited: &mut BTreeSet<String>) {
        if !visited.insert(task_name.to_string()) {
            return;
        }
        let node_name = dag.task_node_name(task_name);
        if self.node(&node_name).map(|n| n.fulfilled()).unwrap_or(false) {
            return;
        }
        let Some(task) = dag.template.task(task_name).cloned() else {
            return;
        };
        let deps = dag.deps_of(task_name).to_vec();
        for dep in &deps {
            self.execute_dag_task(dag, base, dep, visited);
        }

        if self.node(&node_name).is_none() {
            let deps_done = deps.iter().all(|d| {
                self.node(&dag.task_node_name(d))
                    .map(|n| n.fulfilled())
                    .unwrap_or(false)
            });
            if !deps_done {
                return;
            }
            if let Some(expr) = dag.depends.get(task_name) {
                let satisfied = expr.evaluate(&|dep: &str, result: Option<TaskResult>| {
                    self.task_result_matches(dag, dep, result)
                });
                if !satisfied {
                    let message = format!("{}: depends condition not met", OMITTED);
                    let node = self.skip_node(&node_name, &task.template, &dag.node_id, &message);
                    self.connect_task(dag, &node.id, &deps);
                    return;
                }
            }
        }

        if let Err(e) = self.run_dag_task(dag, base, &task, &node_name, &deps) {
            warn!(workflow = %self.key, task = task_name, "task failed: {}", e);
            let message = e.message();
            let node_type = if task.is_expanded() {
                NodeType::TaskGroup
            } else {
                NodeType::Skipped
            };
            let node = self.init_node(
                &node_name,
                node_type,
                None,
                &dag.node_id,
                NodePhase::Error,
                &message,
            );
            self.mark_node(&node.id, NodePhase::Error, &message);
            self.connect_task(dag, &node.id, &deps);
        }
    }

    fn run_dag_task(
        &mut self,
        dag: &Dag,
        base: &Scope,
        task: &DagTask,
        node_name: &str,
        deps: &[String],
    ) -> Result<(), WfError> {
        let scope = self.dag_scope(dag, base, &dag.ancestors(&task.name));
        let resolved = self.resolve_references(task, &scope)?;
        if !task.is_expanded() {
            if let Some(node) = self.run_dag_single(dag, &resolved, node_name)? {
                self.connect_task(dag, &node.id, deps);
            }
            return Ok(());
        }

        let template = Template {
            name: task.template.clone(),
            ..Default::default()
        };
        let group = self.init_node(
            node_name,
            NodeType::TaskGroup,
            Some(&template),
            &dag.node_id,
            NodePhase::Running,
            "",
        );
        self.connect_task(dag, &group.id, deps);
        let children = expand(&resolved)?;
        if children.is_empty() {
            self.mark_node(&group.id, NodePhase::Skipped, "Skipped, empty params");
            return Ok(());
        }
        let mut nodes = Vec::with_capacity(children.len());
        for child in &children {
            let child_name = dag.task_node_name(&child.name);
            let node = self.run_dag_single(dag, child, &child_name)?;
            if let Some(node) = &node {
                self.wf.status.nodes.add_child(&group.id, &node.id);
            }
            nodes.push(node);
        }
        if nodes.iter().any(|n| !n.as_ref().map(|n| n.fulfilled()).unwrap_or(false)) {
            return Ok(());
        }
        let failed = nodes
            .iter()
            .flatten()
            .find(|n| n.phase.failed_or_error() && !continues(task.continue_on.as_ref(), n.phase));
        match failed {
            Some(child) => {
                let message = format!("child '{}' failed", child.id);
                self.mark_node(&group.id, child.phase, &message);
            }
            None => {
                self.mark_node(&group.id, NodePhase::Succeeded, "");
            }
        }
        Ok(())
    }

    fn run_dag_single(&mut self, dag: &Dag, task: &DagTask, name: &str) -> Result<Option<NodeStatus>, WfError> {
        if let Some(node) = self.node(name) {
            if node.fulfilled() {
                return Ok(Some(node.clone()));
            }
        } else if !task.when.is_empty() && !should_execute(&task.when)? {
            let message = format!("when '{}' evaluated false", task.when);
            return Ok(Some(self.skip_node(name, &task.template, &dag.node_id, &message)));
        }
        let (template_name, inline) = task.template_ref();
        let template = self.resolve_template(template_name, inline)?;
        Ok(self.execute_template(name, &template, task.arguments(), &dag.node_id))
    }

    /// Tasks without dependencies hang off the DAG node, the rest off each dependency
    fn connect_task(&mut self, dag: &Dag, id: &str, deps: &[String]) {
        if deps.is_empty() {
            self.wf.status.nodes.add_child(&dag.node_id, id);
            return;
        }
        for dep in deps {
            let parent = self.id(&dag.task_node_name(dep));
            self.wf.status.nodes.add_child(&parent, id);
        }
    }

    fn task_result_matches(&self, dag: &Dag, task: &str, result: Option<TaskResult>) -> bool {
        let Some(node) = self.node(&dag.task_node_name(task)) else {
            return false;
        };
        if node.node_type != NodeType::TaskGroup {
            return node_matches(node, result);
        }
        let children = self.wf.status.nodes.children(&node.id);
        match result {
            Some(TaskResult::AnySucceeded) => children.iter().any(|c| c.succeeded()),
            Some(TaskResult::AllFailed) => {
                !children.is_empty() && children.iter().all(|c| c.phase == NodePhase::Failed)
            }
            other => node_matches(node, other),
        }
    }

    /// Scope with the outputs of `tasks`, oldest first
    fn dag_scope(&self, dag: &Dag, base: &Scope, tasks: &[String]) -> Scope {
        let mut scope = base.clone();
        let mut nodes: Vec<(&String, &NodeStatus)> = tasks
            .iter()
            .filter_map(|t| self.node(&dag.task_node_name(t)).map(|n| (t, n)))
            .collect();
        nodes.sort_by_key(|(_, n)| n.sort_time(self.now));
        for (task, node) in nodes {
            let prefix = format!("tasks.{}", task);
            if node.node_type == NodeType::TaskGroup {
                let children: Vec<&NodeStatus> = self
                    .wf
                    .status
                    .nodes
                    .children(&node.id)
                    .into_iter()
                    .filter(|c| c.phase != NodePhase::Skipped)
                    .collect();
                scope.add_aggregated_outputs(&prefix, &children);
            } else {
                scope.add_node_outputs(&prefix, node);
            }
        }
        scope
    }

    /// Phase and message of the DAG once it is decided; `None` while still running
    ///
    /// Omitted tasks inherit the phase of their branch, so a target that was
    /// omitted because an ancestor failed counts as failed.
    fn assess_dag_phase(&self, dag: &Dag, targets: &[String]) -> Option<(NodePhase, String)> {
        let task_ids: BTreeSet<String> = dag
            .template
            .tasks
            .iter()
            .map(|t| self.id(&dag.task_node_name(&t.name)))
            .collect();
        let mut target_phases: BTreeMap<String, Option<(NodePhase, String)>> = targets
            .iter()
            .map(|t| (self.id(&dag.task_node_name(t)), None))
            .collect();

        let root = self.wf.status.nodes.get(&dag.node_id)?;
        let mut queue: VecDeque<(String, (NodePhase, String))> = root
            .children
            .iter()
            .map(|id| (id.clone(), (NodePhase::Succeeded, String::new())))
            .collect();
        let mut seen = BTreeSet::new();
        while let Some((id, inherited)) = queue.pop_front() {
            let node = self.wf.status.nodes.get(&id)?;
            if !node.fulfilled() {
                return None;
            }
            let branch = if omitted(node) {
                inherited
            } else {
                (node.phase, node.message.clone())
            };
            if let Some(phase) = target_phases.get_mut(&id) {
                let keep = phase.as_ref().map(|(p, _)| p.failed_or_error()).unwrap_or(false);
                if !keep {
                    *phase = Some(branch.clone());
                }
            }
            // a failed branch may revisit a node that was first reached through a successful one
            if !seen.insert((id.clone(), branch.0.failed_or_error())) {
                continue;
            }
            // children of a task node are its dependents; task groups also list their items
            for child in node.children.iter().filter(|c| task_ids.contains(*c)) {
                queue.push_back((child.clone(), branch.clone()));
            }
        }

        let mut result = Some((NodePhase::Succeeded, String::new()));
        for target in targets {
            match target_phases.remove(&self.id(&dag.task_node_name(target))).flatten() {
                None => {
                    result = None;
                    if !dag.fail_fast {
                        break;
                    }
                }
                Some((phase, message)) if phase.failed_or_error() => {
                    let continue_on = dag.template.task(target).and_then(|t| t.continue_on.as_ref());
                    if continues(continue_on, phase) {
                        continue;
                    }
                    result = Some((phase, message));
                    if dag.fail_fast {
                        break;
                    }
                }
                Some(_) => {}
            }
        }
        result
    }
}
