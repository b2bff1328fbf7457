//! Capping how many completed workflows of each class are kept

use std::collections::BTreeMap;

use tracing::{info, warn};
use workflow_api::{RetentionPolicy, Workflow, WorkflowPhase};

use crate::cluster::{Api, DeleteOptions, ListParams, SharedClient};
use crate::errors::WfError;

/// Keys of the workflows the policy no longer keeps
///
/// Completed workflows are grouped by phase and sorted newest first by
/// creation time; each group keeps its cap and the rest are returned.
/// A class without a cap keeps everything.
pub fn select_for_deletion(policy: &RetentionPolicy, workflows: &[Workflow]) -> Vec<String> {
    let mut classes: BTreeMap<&'static str, Vec<&Workflow>> = BTreeMap::new();
    for wf in workflows.iter().filter(|wf| wf.completed()) {
        let class = match wf.status.phase {
            WorkflowPhase::Error => "errored",
            WorkflowPhase::Failed => "failed",
            _ => "completed",
        };
        classes.entry(class).or_default().push(wf);
    }

    let mut doomed = Vec::new();
    for class in ["errored", "failed", "completed"] {
        let Some(mut members) = classes.remove(class) else {
            continue;
        };
        let Some(cap) = members.first().and_then(|wf| policy.cap(wf.status.phase)) else {
            continue;
        };
        members.sort_by(|a, b| {
            b.metadata
                .creation_timestamp
                .cmp(&a.metadata.creation_timestamp)
                .then_with(|| a.name().cmp(b.name()))
        });
        doomed.extend(members.into_iter().skip(cap).map(|wf| wf.metadata.key()));
    }
    doomed
}

/// One retention pass over `namespace` (every namespace when empty)
pub async fn enforce(
    client: &SharedClient,
    namespace: &str,
    policy: &RetentionPolicy,
) -> Result<usize, WfError> {
    let api: Api<Workflow> = Api::namespaced(client.clone(), namespace);
    let workflows = api.list(&ListParams::default()).await?;
    let mut deleted = 0;
    for key in select_for_deletion(policy, &workflows) {
        let (ns, name) = workflow_api::meta::split_key(&key);
        let api: Api<Workflow> = Api::namespaced(client.clone(), ns);
        match api.delete(name, &DeleteOptions::background()).await {
            Ok(()) => {
                info!(workflow = %key, "deleted workflow by retention policy");
                deleted += 1;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(workflow = %key, "failed to delete workflow: {}", e),
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::InMemoryCluster;
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use workflow_api::ObjectMeta;

    fn wf(name: &str, phase: WorkflowPhase, age_minutes: i64) -> Workflow {
        let mut wf = Workflow {
            metadata: ObjectMeta::named("argo", name),
            ..Default::default()
        };
        wf.metadata.creation_timestamp = Some(Utc::now() - Duration::minutes(age_minutes));
        wf.status.phase = phase;
        wf
    }

    #[test]
    fn test_caps_per_class() {
        let policy = RetentionPolicy {
            completed: Some(1),
            failed: Some(2),
            errored: Some(0),
        };
        let workflows = vec![
            wf("ok-old", WorkflowPhase::Succeeded, 30),
            wf("ok-new", WorkflowPhase::Succeeded, 1),
            wf("failed-1", WorkflowPhase::Failed, 3),
            wf("failed-2", WorkflowPhase::Failed, 2),
            wf("failed-3", WorkflowPhase::Failed, 10),
            wf("error", WorkflowPhase::Error, 5),
            wf("running", WorkflowPhase::Running, 100),
        ];
        let mut doomed = select_for_deletion(&policy, &workflows);
        doomed.sort();
        assert_eq!(doomed, vec!["argo/error", "argo/failed-3", "argo/ok-old"]);
    }

    #[test]
    fn test_uncapped_class_is_kept() {
        let policy = RetentionPolicy {
            completed: Some(0),
            ..Default::default()
        };
        let workflows = vec![
            wf("ok", WorkflowPhase::Succeeded, 1),
            wf("failed", WorkflowPhase::Failed, 1),
        ];
        assert_eq!(select_for_deletion(&policy, &workflows), vec!["argo/ok"]);
    }

    #[tokio::test]
    async fn test_enforce_deletes_in_cluster() {
        let clock = ManualClock::new(Utc::now());
        let cluster: SharedClient = Arc::new(InMemoryCluster::with_clock(Arc::new(clock.clone())));
        let api: Api<Workflow> = Api::namespaced(cluster.clone(), "argo");
        for i in 0..3 {
            api.create(&wf(&format!("ok-{}", i), WorkflowPhase::Succeeded, 0))
                .await
                .unwrap();
            clock.advance(Duration::minutes(1));
        }
        let policy = RetentionPolicy {
            completed: Some(2),
            ..Default::default()
        };
        assert_eq!(enforce(&cluster, "argo", &policy).await.unwrap(), 1);
        let left: Vec<String> = api
            .list(&ListParams::default())
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.metadata.name)
            .collect();
        assert_eq!(left.len(), 2);
        assert!(!left.contains(&"ok-0".to_string()));
    }
}
