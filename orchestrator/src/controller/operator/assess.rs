//! Folding observed pods, task results and agent replies into node phases

use workflow_api::common::{ANNOTATION_KEY_TEMPLATE, MAIN_CONTAINER_NAME, WAIT_CONTAINER_NAME};
use workflow_api::{NodePhase, NodeType, Outputs, Pod, PodPhase, Template, WorkflowTaskResult};

use super::Operator;

/// User containers of a pod, read back from its template annotation
fn main_container_names(pod: &Pod) -> Vec<String> {
    pod.metadata
        .annotations
        .get(ANNOTATION_KEY_TEMPLATE)
        .and_then(|t| serde_json::from_str::<Template>(t).ok())
        .map(|t| t.main_container_names())
        .unwrap_or_else(|| vec![MAIN_CONTAINER_NAME.to_string()])
}

fn pending_message(pod: &Pod) -> String {
    pod.status
        .init_container_statuses
        .iter()
        .chain(pod.status.container_statuses.iter())
        .find_map(|s| s.state.waiting.as_ref().filter(|w| !w.reason.is_empty()))
        .map(|w| {
            if w.message.is_empty() {
                w.reason.clone()
            } else {
                format!("{}: {}", w.reason, w.message)
            }
        })
        .unwrap_or_else(|| pod.status.message.clone())
}

fn pod_failure(pod: &Pod, result: Option<&WorkflowTaskResult>) -> (NodePhase, String) {
    if !pod.status.message.is_empty() {
        return (NodePhase::Failed, pod.status.message.clone());
    }
    for status in &pod.status.init_container_statuses {
        if let Some(terminated) = status.state.terminated.as_ref().filter(|t| t.exit_code != 0) {
            return (
                NodePhase::Error,
                format!(
                    "init container {} failed with exit code {}",
                    status.name, terminated.exit_code
                ),
            );
        }
    }
    for name in main_container_names(pod) {
        let terminated = pod
            .container_status(&name)
            .and_then(|s| s.state.terminated.as_ref())
            .filter(|t| t.exit_code != 0);
        if let Some(terminated) = terminated {
            let message = if terminated.message.is_empty() {
                format!("Error (exit code {})", terminated.exit_code)
            } else {
                terminated.message.clone()
            };
            return (NodePhase::Failed, message);
        }
    }
    if let Some(code) = pod.exit_code(WAIT_CONTAINER_NAME).filter(|c| *c != 0) {
        return (
            NodePhase::Error,
            format!("wait container failed with exit code {}", code),
        );
    }
    if let Some(result) = result.filter(|r| !r.result.message.is_empty()) {
        let phase = result
            .result
            .phase
            .filter(NodePhase::failed_or_error)
            .unwrap_or(NodePhase::Error);
        return (phase, result.result.message.clone());
    }
    (NodePhase::Failed, "pod failed".to_string())
}

/// Node phase and message for a pod and its reported outputs
///
/// A finished pod only finalizes its node once outputs are in: the task
/// result says so, or the wait container has exited (or never existed).
pub fn pod_phase(pod: &Pod, result: Option<&WorkflowTaskResult>) -> (NodePhase, String) {
    let outputs_in = result.map(|r| r.outputs_completed()).unwrap_or(false)
        || pod
            .container_status(WAIT_CONTAINER_NAME)
            .map(|s| s.state.terminated.is_some())
            .unwrap_or(true);
    match pod.status.phase {
        PodPhase::Pending => (NodePhase::Pending, pending_message(pod)),
        PodPhase::Running => (NodePhase::Running, String::new()),
        PodPhase::Succeeded if outputs_in => (NodePhase::Succeeded, String::new()),
        PodPhase::Failed if outputs_in => pod_failure(pod, result),
        PodPhase::Succeeded | PodPhase::Failed => (NodePhase::Running, String::new()),
        PodPhase::Unknown => (NodePhase::Error, "pod phase is Unknown".to_string()),
    }
}

impl Operator<'_> {
    /// Bring pod and HTTP nodes up to date with what the cluster reports
    pub(super) fn assess_nodes(&mut self) {
        let pending: Vec<(String, NodeType)> = self
            .wf
            .status
            .nodes
            .iter()
            .filter(|n| !n.fulfilled() && matches!(n.node_type, NodeType::Pod | NodeType::Http))
            .map(|n| (n.id.clone(), n.node_type))
            .collect();
        for (id, node_type) in pending {
            match node_type {
                NodeType::Http => self.assess_http_node(&id),
                _ => self.assess_pod_node(&id),
            }
        }
        for (id, result) in &self.results {
            self.wf
                .status
                .task_results_completion_status
                .insert(id.clone(), result.outputs_completed());
        }
        let running = self.pods.values().any(|p| p.status.phase == PodPhase::Running);
        self.wf
            .status
            .set_condition("PodRunning", if running { "True" } else { "False" }, "");
    }

    fn assess_pod_node(&mut self, id: &str) {
        let result = self.results.get(id).cloned();
        let Some(pod) = self.pods.get(id).cloned() else {
            let Some(node) = self.node_by_id(id) else {
                return;
            };
            if node.phase == NodePhase::Pending {
                return;
            }
            match result.filter(|r| r.result.fulfilled()) {
                Some(result) => {
                    self.apply_outputs(id, result.result.outputs.clone(), None, &result.result.progress);
                    let phase = result.result.phase.unwrap_or(NodePhase::Error);
                    self.mark_node(id, phase, &result.result.message);
                }
                None => {
                    self.mark_node(id, NodePhase::Error, "pod deleted");
                }
            }
            return;
        };

        let (phase, message) = pod_phase(&pod, result.as_ref());
        let exit_code = main_container_names(&pod)
            .first()
            .and_then(|name| pod.exit_code(name));
        let (outputs, progress) = match &result {
            Some(result) => (result.result.outputs.clone(), result.result.progress.clone()),
            None => (None, String::new()),
        };
        self.apply_outputs(id, outputs, exit_code, &progress);
        if let Some(node) = self.wf.status.nodes.get_mut(id) {
            if !pod.spec.node_name.is_empty() {
                node.host_node_name = pod.spec.node_name.clone();
            }
        }
        self.mark_node(id, phase, &message);
        if phase.fulfilled() {
            self.active_pods = self.active_pods.saturating_sub(1);
        }
    }

    fn apply_outputs(&mut self, id: &str, outputs: Option<Outputs>, exit_code: Option<i32>, progress: &str) {
        let Some(node) = self.wf.status.nodes.get_mut(id) else {
            return;
        };
        if outputs.is_some() {
            node.outputs = outputs;
        }
        if let Some(code) = exit_code {
            node.outputs.get_or_insert_with(Outputs::default).exit_code = Some(code.to_string());
        }
        if !progress.is_empty() {
            node.progress = progress.to_string();
        }
    }

    fn assess_http_node(&mut self, id: &str) {
        let Some(result) = self
            .task_set
            .as_ref()
            .and_then(|set| set.status.nodes.get(id))
            .cloned()
        else {
            return;
        };
        self.apply_outputs(id, result.outputs.clone(), None, &result.progress);
        if let Some(phase) = result.phase {
            self.mark_node(id, phase, &result.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_api::common::LABEL_KEY_REPORT_OUTPUTS_COMPLETED;
    use workflow_api::pod::{ContainerState, ContainerStateTerminated, ContainerStatus};
    use workflow_api::ObjectMeta;

    fn terminated(name: &str, code: i32) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: code,
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn running(name: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: ContainerState {
                running: Some(Default::default()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_succeeded_waits_for_outputs() {
        let mut pod = Pod::default();
        pod.status.phase = PodPhase::Succeeded;
        pod.status.container_statuses = vec![terminated("main", 0), running("wait")];
        assert_eq!(pod_phase(&pod, None).0, NodePhase::Running);

        let mut result = WorkflowTaskResult::new(ObjectMeta::named("argo", "n"));
        result
            .metadata
            .labels
            .insert(LABEL_KEY_REPORT_OUTPUTS_COMPLETED.to_string(), "true".to_string());
        assert_eq!(pod_phase(&pod, Some(&result)).0, NodePhase::Succeeded);

        pod.status.container_statuses = vec![terminated("main", 0), terminated("wait", 0)];
        assert_eq!(pod_phase(&pod, None).0, NodePhase::Succeeded);
    }

    #[test]
    fn test_failure_messages() {
        let mut pod = Pod::default();
        pod.status.phase = PodPhase::Failed;
        pod.status.container_statuses = vec![terminated("main", 3), terminated("wait", 0)];
        assert_eq!(
            pod_phase(&pod, None),
            (NodePhase::Failed, "Error (exit code 3)".to_string())
        );

        pod.status.container_statuses = vec![terminated("main", 0), terminated("wait", 1)];
        assert_eq!(pod_phase(&pod, None).0, NodePhase::Error);

        pod.status.message = "Pod was active on the node longer than the specified deadline".to_string();
        assert_eq!(
            pod_phase(&pod, None),
            (NodePhase::Failed, pod.status.message.clone())
        );
    }

    #[test]
    fn test_pending_reason() {
        let mut pod = Pod::default();
        pod.status.container_statuses = vec![ContainerStatus {
            name: "main".to_string(),
            state: ContainerState {
                waiting: Some(workflow_api::pod::ContainerStateWaiting {
                    reason: "ImagePullBackOff".to_string(),
                    message: "not found".to_string(),
                }),
                ..Default::default()
            },
            ..Default::default()
        }];
        assert_eq!(
            pod_phase(&pod, None),
            (NodePhase::Pending, "ImagePullBackOff: not found".to_string())
        );
    }
}
