//! Admission checks run before a workflow starts

use std::collections::{BTreeMap, HashSet};

use workflow_api::{Artifact, DagTemplate, Template, WorkflowSpec};

use super::depends;
use crate::errors::WfError;

fn invalid(message: String) -> WfError {
    WfError::BadRequest(message)
}

/// Validate a workflow spec; the error message is surfaced on the workflow
pub fn validate_workflow(spec: &WorkflowSpec) -> Result<(), WfError> {
    if spec.entrypoint.is_empty() {
        return Err(invalid("spec.entrypoint is required".to_string()));
    }
    let mut names = HashSet::new();
    for template in &spec.templates {
        if template.name.is_empty() {
            return Err(invalid("every template must have a name".to_string()));
        }
        if !names.insert(template.name.as_str()) {
            return Err(invalid(format!("template '{}' is defined more than once", template.name)));
        }
    }
    if spec.template(&spec.entrypoint).is_none() {
        return Err(invalid(format!(
            "spec.entrypoint template '{}' not found",
            spec.entrypoint
        )));
    }
    if !spec.on_exit.is_empty() && spec.template(&spec.on_exit).is_none() {
        return Err(invalid(format!("spec.onExit template '{}' not found", spec.on_exit)));
    }
    for artifact in &spec.arguments.artifacts {
        validate_artifact("spec.arguments", artifact)?;
    }
    for template in &spec.templates {
        validate_template(spec, template)?;
    }
    Ok(())
}

fn validate_artifact(owner: &str, artifact: &Artifact) -> Result<(), WfError> {
    artifact
        .location
        .kind()
        .map(|_| ())
        .map_err(|e| invalid(format!("{}.artifacts.{}: {}", owner, artifact.name, e)))
}

fn validate_reference(spec: &WorkflowSpec, owner: &str, name: &str, inline: Option<&Template>) -> Result<(), WfError> {
    match inline {
        Some(template) => validate_template(spec, template),
        None if name.is_empty() => Err(invalid(format!("{} must reference a template", owner))),
        None if spec.template(name).is_none() => {
            Err(invalid(format!("{} references template '{}' which is not defined", owner, name)))
        }
        None => Ok(()),
    }
}

fn validate_template(spec: &WorkflowSpec, template: &Template) -> Result<(), WfError> {
    template
        .template_type()
        .map_err(invalid)?;
    let owner = format!("templates.{}", template.name);
    for artifact in &template.inputs.artifacts {
        validate_artifact(&format!("{}.inputs", owner), artifact)?;
    }
    for artifact in &template.outputs.artifacts {
        validate_artifact(&format!("{}.outputs", owner), artifact)?;
    }
    if let Some(groups) = &template.steps {
        let mut seen = HashSet::new();
        for group in groups {
            for step in group {
                if step.name.is_empty() {
                    return Err(invalid(format!("{}.steps: every step must have a name", owner)));
                }
                if !seen.insert(step.name.as_str()) {
                    return Err(invalid(format!("{}.steps: step name '{}' is not unique", owner, step.name)));
                }
                validate_reference(
                    spec,
                    &format!("{}.steps.{}", owner, step.name),
                    &step.template,
                    step.inline.as_deref(),
                )?;
            }
        }
    }
    if let Some(dag) = &template.dag {
        validate_dag(spec, &owner, dag)?;
    }
    Ok(())
}

/// Dependencies of every DAG task, from `depends` or the legacy list
pub fn task_dependencies(dag: &DagTemplate) -> Result<BTreeMap<String, Vec<String>>, WfError> {
    let mut out = BTreeMap::new();
    for task in &dag.tasks {
        let deps = if !task.depends.is_empty() {
            depends::parse(&task.depends)?.tasks()
        } else {
            task.dependencies.clone()
        };
        out.insert(task.name.clone(), deps);
    }
    Ok(out)
}

fn validate_dag(spec: &WorkflowSpec, owner: &str, dag: &DagTemplate) -> Result<(), WfError> {
    let mut seen = HashSet::new();
    for task in &dag.tasks {
        if task.name.is_empty() {
            return Err(invalid(format!("{}.dag: every task must have a name", owner)));
        }
        if !seen.insert(task.name.as_str()) {
            return Err(invalid(format!("{}.dag: task name '{}' is not unique", owner, task.name)));
        }
        if !task.depends.is_empty() && !task.dependencies.is_empty() {
            return Err(invalid(format!(
                "{}.dag.{}: cannot use both 'depends' and 'dependencies'",
                owner, task.name
            )));
        }
        validate_reference(
            spec,
            &format!("{}.dag.{}", owner, task.name),
            &task.template,
            task.inline.as_deref(),
        )?;
    }
    let deps = task_dependencies(dag).map_err(|e| invalid(format!("{}.dag: {}", owner, e)))?;
    for (task, task_deps) in &deps {
        for dep in task_deps {
            if !deps.contains_key(dep) {
                return Err(invalid(format!(
                    "{}.dag.{} dependency '{}' not defined",
                    owner, task, dep
                )));
            }
        }
    }
    for target in dag.target.split_whitespace() {
        if !deps.contains_key(target) {
            return Err(invalid(format!("{}.dag: target '{}' is not a task", owner, target)));
        }
    }
    if let Some(task) = find_cycle(&deps) {
        return Err(invalid(format!("{}.dag: dependency cycle detected at task '{}'", owner, task)));
    }
    Ok(())
}

fn find_cycle(deps: &BTreeMap<String, Vec<String>>) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        task: &'a str,
        deps: &'a BTreeMap<String, Vec<String>>,
        marks: &mut BTreeMap<&'a str, Mark>,
    ) -> Option<String> {
        match marks.get(task) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(task.to_string()),
            None => {}
        }
        marks.insert(task, Mark::Visiting);
        for dep in deps.get(task).into_iter().flatten() {
            if let Some(cycle) = visit(dep, deps, marks) {
                return Some(cycle);
            }
        }
        marks.insert(task, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    deps.keys().find_map(|task| visit(task, deps, &mut marks))
}
