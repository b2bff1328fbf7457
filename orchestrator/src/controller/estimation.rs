//! Duration estimates taken from a previous run of the same workflow family

use workflow_api::common::{
    LABEL_KEY_CLUSTER_WORKFLOW_TEMPLATE, LABEL_KEY_CRON_WORKFLOW, LABEL_KEY_WORKFLOW_TEMPLATE,
};
use workflow_api::{Workflow, WorkflowPhase};

/// Label that groups a workflow with earlier runs of the same definition
pub fn baseline_label(wf: &Workflow) -> Option<(&'static str, String)> {
    [
        LABEL_KEY_WORKFLOW_TEMPLATE,
        LABEL_KEY_CLUSTER_WORKFLOW_TEMPLATE,
        LABEL_KEY_CRON_WORKFLOW,
    ]
    .into_iter()
    .find_map(|key| wf.metadata.labels.get(key).map(|v| (key, v.clone())))
}

/// Most recently finished successful run other than `wf` itself
pub fn pick_baseline(wf: &Workflow, candidates: Vec<Workflow>) -> Option<Workflow> {
    candidates
        .into_iter()
        .filter(|c| c.uid() != wf.uid() && c.name() != wf.name())
        .filter(|c| c.status.phase == WorkflowPhase::Succeeded && c.status.finished_at.is_some())
        .max_by_key(|c| c.status.finished_at)
}

/// Estimates node and workflow durations from a baseline run
#[derive(Debug, Clone, Default)]
pub struct Estimator {
    baseline: Option<Workflow>,
}

impl Estimator {
    pub fn new(baseline: Option<Workflow>) -> Self {
        Self { baseline }
    }

    pub fn workflow_duration(&self) -> Option<i64> {
        let status = &self.baseline.as_ref()?.status;
        Some((status.finished_at? - status.started_at?).num_seconds())
    }

    /// Duration of the baseline node whose name matches `node_name` once
    /// the workflow name prefix is swapped
    pub fn node_duration(&self, wf_name: &str, node_name: &str) -> Option<i64> {
        let baseline = self.baseline.as_ref()?;
        let suffix = node_name.strip_prefix(wf_name)?;
        let name = format!("{}{}", baseline.name(), suffix);
        let node = baseline.status.nodes.find_by_name(&name)?;
        Some((node.finished_at? - node.started_at?).num_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use workflow_api::{NodePhase, NodeStatus, ObjectMeta};

    fn run(name: &str, phase: WorkflowPhase, age_minutes: i64) -> Workflow {
        let mut wf = Workflow {
            metadata: ObjectMeta::named("argo", name),
            ..Default::default()
        };
        wf.metadata.uid = format!("uid-{}", name);
        wf.metadata
            .labels
            .insert(LABEL_KEY_WORKFLOW_TEMPLATE.to_string(), "tmpl".to_string());
        let finished = Utc::now() - Duration::minutes(age_minutes);
        wf.status.phase = phase;
        wf.status.started_at = Some(finished - Duration::seconds(90));
        wf.status.finished_at = Some(finished);
        wf.status.nodes.insert(NodeStatus {
            id: format!("{}-1", name),
            name: format!("{}.step", name),
            phase: NodePhase::Succeeded,
            started_at: Some(finished - Duration::seconds(30)),
            finished_at: Some(finished),
            ..Default::default()
        });
        wf
    }

    #[test]
    fn test_baseline_selection_and_estimates() {
        let current = run("wf-new", WorkflowPhase::Running, 0);
        assert_eq!(
            baseline_label(&current),
            Some((LABEL_KEY_WORKFLOW_TEMPLATE, "tmpl".to_string()))
        );
        let candidates = vec![
            run("wf-old", WorkflowPhase::Succeeded, 60),
            run("wf-recent", WorkflowPhase::Succeeded, 5),
            run("wf-failed", WorkflowPhase::Failed, 1),
            current.clone(),
        ];
        let baseline = pick_baseline(&current, candidates).unwrap();
        assert_eq!(baseline.name(), "wf-recent");

        let estimator = Estimator::new(Some(baseline));
        assert_eq!(estimator.workflow_duration(), Some(90));
        assert_eq!(estimator.node_duration("wf-new", "wf-new.step"), Some(30));
        assert_eq!(estimator.node_duration("wf-new", "wf-new.other"), None);
        assert_eq!(Estimator::default().workflow_duration(), None);
    }
}
