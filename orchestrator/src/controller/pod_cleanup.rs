//! Pod cleanup: labelling, deletion, termination and finalizer removal
//!
//! Pod events are turned into `(namespace, pod, action)` keys on a
//! rate-limited queue. Deletions wait for the GC delete delay; every other
//! action runs immediately.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use workflow_api::common::*;
use workflow_api::pod::ContainerStatus;
use workflow_api::{Pod, PodGcStrategy, PodPhase, Workflow, WorkflowPhase};

use super::workqueue::WorkQueue;
use crate::cluster::{Api, DeleteOptions, SharedClient};
use crate::errors::WfError;
use crate::storage::settings::Settings;
use crate::utils::parse_duration;

/// Minimum wait before the finalizer of a deleted pod is removed
const FINALIZER_REMOVAL_DELAY: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PodCleanupAction {
    NoAction,
    DeletePod,
    LabelPodCompleted,
    TerminateContainers,
    KillContainers,
    RemoveFinalizer,
}

impl PodCleanupAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodCleanupAction::NoAction => "noAction",
            PodCleanupAction::DeletePod => "deletePod",
            PodCleanupAction::LabelPodCompleted => "labelPodCompleted",
            PodCleanupAction::TerminateContainers => "terminateContainers",
            PodCleanupAction::KillContainers => "killContainers",
            PodCleanupAction::RemoveFinalizer => "removeFinalizer",
        }
    }
}

impl fmt::Display for PodCleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodCleanupKey {
    pub namespace: String,
    pub name: String,
    pub action: PodCleanupAction,
}

impl PodCleanupKey {
    pub fn new(namespace: &str, name: &str, action: PodCleanupAction) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            action,
        }
    }
}

impl fmt::Display for PodCleanupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.name, self.action)
    }
}

/// GC strategy and delete delay of a pod
///
/// The pod annotation wins; pods created before the annotation existed fall
/// back to the workflow spec.
pub fn pod_gc_of(pod: &Pod, wf: Option<&Workflow>) -> (PodGcStrategy, Duration) {
    let (strategy, delay) = match pod.metadata.annotation(ANNOTATION_KEY_POD_GC_STRATEGY) {
        Some(value) => {
            let (strategy, delay) = match value.split_once('/') {
                Some((s, d)) => (s, Some(d.to_string())),
                None => (value, None),
            };
            let strategy = strategy.parse::<PodGcStrategy>().unwrap_or_else(|e: String| {
                warn!(pod = %pod.metadata.name, "{}", e);
                PodGcStrategy::OnPodNone
            });
            (strategy, delay)
        }
        None => {
            let gc = wf.and_then(|w| w.spec.pod_gc.clone()).unwrap_or_default();
            (gc.strategy, gc.delete_delay_duration)
        }
    };
    let delay = delay
        .filter(|d| !d.is_empty())
        .map(|d| {
            parse_duration(&d).unwrap_or_else(|e| {
                warn!(pod = %pod.metadata.name, "invalid pod GC delete delay '{}': {}", d, e);
                Duration::ZERO
            })
        })
        .unwrap_or(Duration::ZERO);
    (strategy, delay)
}

fn has_our_finalizer(pod: &Pod) -> bool {
    pod.metadata.has_finalizer(FINALIZER_POD_STATUS)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

fn until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

/// Actions to enqueue for `pod`, each with the delay before it runs
///
/// `wf` is the owning workflow, `None` when it no longer exists.
pub fn cleanup_actions(
    settings: &Settings,
    wf: Option<&Workflow>,
    pod: &Pod,
    now: DateTime<Utc>,
) -> Vec<(PodCleanupAction, Duration)> {
    let (strategy, delay) = pod_gc_of(pod, wf);

    if pod.metadata.is_being_deleted() {
        if !has_our_finalizer(pod) {
            return Vec::new();
        }
        // leave the workflow controller time to record the final pod status
        let wait = delay.max(FINALIZER_REMOVAL_DELAY);
        let after = pod
            .last_transition()
            .map(|since| until(since + to_chrono(wait), now))
            .unwrap_or(Duration::ZERO);
        return vec![(PodCleanupAction::RemoveFinalizer, after)];
    }

    let wf = match wf {
        Some(wf) if !wf.metadata.is_being_deleted() => wf,
        _ => {
            let mut actions = Vec::new();
            if has_our_finalizer(pod) {
                actions.push((PodCleanupAction::RemoveFinalizer, Duration::ZERO));
            }
            let deletes = match strategy {
                PodGcStrategy::OnPodNone => false,
                PodGcStrategy::OnPodSuccess => pod.status.phase == PodPhase::Succeeded,
                _ => true,
            };
            if deletes {
                let orphan_delay = parse_duration(&settings.pod_gc_delete_delay_duration).unwrap_or(Duration::ZERO);
                let since = pod.last_transition().unwrap_or(now);
                actions.push((
                    PodCleanupAction::DeletePod,
                    until(since + to_chrono(delay.max(orphan_delay)), now),
                ));
            }
            return actions;
        }
    };

    if !pod.status.phase.is_completed() {
        return if wf.completed() {
            vec![(PodCleanupAction::TerminateContainers, Duration::ZERO)]
        } else {
            Vec::new()
        };
    }

    let selected = wf
        .spec
        .pod_gc
        .as_ref()
        .and_then(|gc| gc.label_selector.as_ref())
        .map(|selector| selector.matches(&pod.metadata.labels))
        .unwrap_or(true);
    let pod_succeeded = pod.status.phase == PodPhase::Succeeded;

    let action = if !selected || strategy == PodGcStrategy::OnPodNone {
        PodCleanupAction::LabelPodCompleted
    } else if (strategy == PodGcStrategy::OnWorkflowCompletion && wf.completed())
        || (strategy == PodGcStrategy::OnWorkflowSuccess && wf.status.phase == WorkflowPhase::Succeeded)
        || strategy == PodGcStrategy::OnPodCompletion
        || (strategy == PodGcStrategy::OnPodSuccess && pod_succeeded)
    {
        PodCleanupAction::DeletePod
    } else if (strategy == PodGcStrategy::OnPodSuccess && !pod_succeeded) || wf.completed() {
        PodCleanupAction::LabelPodCompleted
    } else if has_our_finalizer(pod) {
        PodCleanupAction::RemoveFinalizer
    } else {
        PodCleanupAction::NoAction
    };

    match action {
        PodCleanupAction::NoAction => Vec::new(),
        PodCleanupAction::DeletePod => vec![
            (PodCleanupAction::LabelPodCompleted, Duration::ZERO),
            (PodCleanupAction::DeletePod, delay),
        ],
        other => vec![(other, Duration::ZERO)],
    }
}

fn statuses_changed(old: &[ContainerStatus], new: &[ContainerStatus], check_ready: bool) -> bool {
    if old.len() != new.len() {
        return true;
    }
    old.iter().zip(new).any(|(a, b)| {
        a.name != b.name || a.state.kind() != b.state.kind() || (check_ready && a.ready != b.ready)
    })
}

/// Whether a pod update can change what the workflow controller decides
pub fn significant_pod_change(old: &Pod, new: &Pod, all_changes_significant: bool) -> bool {
    if all_changes_significant {
        return true;
    }
    if old.spec.node_name != new.spec.node_name
        || old.status.phase != new.status.phase
        || old.status.message != new.status.message
        || old.status.pod_ip != new.status.pod_ip
        || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
        || old.metadata.annotations != new.metadata.annotations
        || old.metadata.labels != new.metadata.labels
    {
        return true;
    }
    if statuses_changed(&old.status.container_statuses, &new.status.container_statuses, true)
        || statuses_changed(&old.status.init_container_statuses, &new.status.init_container_statuses, false)
    {
        return true;
    }
    if old.status.conditions.len() != new.status.conditions.len() {
        return true;
    }
    old.status
        .conditions
        .iter()
        .zip(&new.status.conditions)
        .any(|(a, b)| a.reason != b.reason || a.message != b.message)
}

/// Enqueue the actions `cleanup_actions` picks for `pod`
pub fn enqueue_pod(
    queue: &WorkQueue<PodCleanupKey>,
    settings: &Settings,
    wf: Option<&Workflow>,
    pod: &Pod,
    now: DateTime<Utc>,
) {
    for (action, delay) in cleanup_actions(settings, wf, pod, now) {
        let key = PodCleanupKey::new(&pod.metadata.namespace, &pod.metadata.name, action);
        debug!(key = %key, ?delay, "queueing pod cleanup");
        queue.add_after(key, delay);
    }
}

/// Carries out queued pod cleanup actions
#[derive(Clone)]
pub struct PodCleaner {
    client: SharedClient,
    queue: WorkQueue<PodCleanupKey>,
    grace_period_seconds: Option<i64>,
}

impl PodCleaner {
    pub fn new(client: SharedClient, queue: WorkQueue<PodCleanupKey>, settings: &Settings) -> Self {
        Self {
            client,
            queue,
            grace_period_seconds: settings.pod_gc_grace_period_seconds,
        }
    }

    pub fn queue(&self) -> &WorkQueue<PodCleanupKey> {
        &self.queue
    }

    /// Run one action; a missing pod counts as done
    pub async fn process(&self, key: &PodCleanupKey) -> Result<(), WfError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        let Some(pod) = pods.get_opt(&key.name).await? else {
            debug!(key = %key, "pod already gone");
            return Ok(());
        };
        match key.action {
            PodCleanupAction::NoAction => Ok(()),
            PodCleanupAction::LabelPodCompleted => self.label_completed(&pods, &pod).await,
            PodCleanupAction::RemoveFinalizer => self.remove_finalizer(&pods, &pod).await,
            PodCleanupAction::DeletePod => self.delete(&pods, &pod).await,
            PodCleanupAction::TerminateContainers => {
                self.signal_containers(&pod, "TERM").await;
                let grace = Duration::from_secs(pod.termination_grace_period().max(0) as u64);
                self.queue.add_after(
                    PodCleanupKey::new(&key.namespace, &key.name, PodCleanupAction::KillContainers),
                    grace,
                );
                Ok(())
            }
            PodCleanupAction::KillContainers => {
                self.signal_containers(&pod, "KILL").await;
                Ok(())
            }
        }
    }

    fn finalizers_without_ours(pod: &Pod) -> Option<Value> {
        if !has_our_finalizer(pod) {
            return None;
        }
        let remaining: Vec<&String> = pod
            .metadata
            .finalizers
            .iter()
            .filter(|f| f.as_str() != FINALIZER_POD_STATUS)
            .collect();
        Some(if remaining.is_empty() { Value::Null } else { json!(remaining) })
    }

    async fn label_completed(&self, pods: &Api<Pod>, pod: &Pod) -> Result<(), WfError> {
        let labelled = pod.metadata.label(LABEL_KEY_COMPLETED) == Some("true");
        let finalizers = Self::finalizers_without_ours(pod);
        if labelled && finalizers.is_none() {
            return Ok(());
        }
        let mut meta = json!({ "labels": { LABEL_KEY_COMPLETED: "true" } });
        if let Some(finalizers) = finalizers {
            meta["finalizers"] = finalizers;
        }
        pods.patch(&pod.metadata.name, &json!({ "metadata": meta })).await?;
        info!(pod = %pod.metadata.name, "labelled pod completed");
        Ok(())
    }

    async fn remove_finalizer(&self, pods: &Api<Pod>, pod: &Pod) -> Result<(), WfError> {
        let Some(finalizers) = Self::finalizers_without_ours(pod) else {
            return Ok(());
        };
        match pods
            .patch(&pod.metadata.name, &json!({ "metadata": { "finalizers": finalizers } }))
            .await
        {
            Ok(_) => {
                info!(pod = %pod.metadata.name, "removed pod finalizer");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, pods: &Api<Pod>, pod: &Pod) -> Result<(), WfError> {
        self.remove_finalizer(pods, pod).await?;
        let mut options = DeleteOptions::background();
        options.grace_period_seconds = self.grace_period_seconds;
        match pods.delete(&pod.metadata.name, &options).await {
            Ok(()) => {
                info!(pod = %pod.metadata.name, "deleted pod");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Send `signal` to PID 1 of every running container except `wait`
    async fn signal_containers(&self, pod: &Pod, signal: &str) {
        let argv = vec!["kill".to_string(), "-s".to_string(), signal.to_string(), "1".to_string()];
        for status in &pod.status.container_statuses {
            if status.name == WAIT_CONTAINER_NAME || status.state.running.is_none() {
                continue;
            }
            match self
                .client
                .exec_in_container(&pod.metadata.namespace, &pod.metadata.name, &status.name, &argv)
                .await
            {
                Ok(_) => info!(pod = %pod.metadata.name, container = %status.name, signal, "signalled container"),
                Err(e) => warn!(pod = %pod.metadata.name, container = %status.name, "failed to signal container: {}", e),
            }
        }
    }
}

/// Label patch that marks a pod completed, used in bulk at workflow completion
pub fn completed_labels() -> BTreeMap<String, Option<String>> {
    BTreeMap::from([(LABEL_KEY_COMPLETED.to_string(), Some("true".to_string()))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use std::sync::Arc;
    use workflow_api::pod::{ContainerState, ContainerStateRunning, PodCondition};
    use workflow_api::workflow::{LabelSelector, PodGc};
    use workflow_api::ObjectMeta;

    fn workflow(phase: WorkflowPhase, strategy: PodGcStrategy) -> Workflow {
        let mut wf = Workflow {
            metadata: ObjectMeta::named("argo", "wf"),
            ..Default::default()
        };
        wf.status.phase = phase;
        wf.spec.pod_gc = Some(PodGc {
            strategy,
            ..Default::default()
        });
        wf
    }

    fn pod(phase: PodPhase) -> Pod {
        let mut pod = Pod {
            metadata: ObjectMeta::named("argo", "wf-1234"),
            ..Default::default()
        };
        pod.metadata
            .labels
            .insert(LABEL_KEY_WORKFLOW.to_string(), "wf".to_string());
        pod.status.phase = phase;
        pod
    }

    fn actions(wf: Option<&Workflow>, pod: &Pod) -> Vec<PodCleanupAction> {
        cleanup_actions(&Settings::default(), wf, pod, Utc::now())
            .into_iter()
            .map(|(a, _)| a)
            .collect()
    }

    #[test]
    fn test_strategy_none_only_labels() {
        let wf = workflow(WorkflowPhase::Succeeded, PodGcStrategy::OnPodNone);
        assert_eq!(
            actions(Some(&wf), &pod(PodPhase::Succeeded)),
            vec![PodCleanupAction::LabelPodCompleted]
        );
    }

    #[test]
    fn test_workflow_completion_deletes_after_delay() {
        let mut wf = workflow(WorkflowPhase::Failed, PodGcStrategy::OnWorkflowCompletion);
        wf.spec.pod_gc.as_mut().unwrap().delete_delay_duration = Some("30s".to_string());
        let planned = cleanup_actions(&Settings::default(), Some(&wf), &pod(PodPhase::Failed), Utc::now());
        assert_eq!(
            planned,
            vec![
                (PodCleanupAction::LabelPodCompleted, Duration::ZERO),
                (PodCleanupAction::DeletePod, Duration::from_secs(30)),
            ]
        );

        wf.status.phase = WorkflowPhase::Running;
        assert!(actions(Some(&wf), &pod(PodPhase::Failed)).is_empty());
    }

    #[test]
    fn test_pod_success_strategy() {
        let wf = workflow(WorkflowPhase::Running, PodGcStrategy::OnPodSuccess);
        assert_eq!(
            actions(Some(&wf), &pod(PodPhase::Succeeded)),
            vec![PodCleanupAction::LabelPodCompleted, PodCleanupAction::DeletePod]
        );
        assert_eq!(
            actions(Some(&wf), &pod(PodPhase::Failed)),
            vec![PodCleanupAction::LabelPodCompleted]
        );
    }

    #[test]
    fn test_selector_miss_labels() {
        let mut wf = workflow(WorkflowPhase::Succeeded, PodGcStrategy::OnPodCompletion);
        wf.spec.pod_gc.as_mut().unwrap().label_selector = Some(LabelSelector {
            match_labels: BTreeMap::from([("gc".to_string(), "yes".to_string())]),
        });
        assert_eq!(
            actions(Some(&wf), &pod(PodPhase::Succeeded)),
            vec![PodCleanupAction::LabelPodCompleted]
        );
    }

    #[test]
    fn test_annotation_overrides_workflow_spec() {
        let wf = workflow(WorkflowPhase::Running, PodGcStrategy::OnPodNone);
        let mut p = pod(PodPhase::Succeeded);
        p.metadata.annotations.insert(
            ANNOTATION_KEY_POD_GC_STRATEGY.to_string(),
            "OnPodCompletion/1m".to_string(),
        );
        assert_eq!(pod_gc_of(&p, Some(&wf)), (PodGcStrategy::OnPodCompletion, Duration::from_secs(60)));
    }

    #[test]
    fn test_running_pod_of_completed_workflow_is_terminated() {
        let wf = workflow(WorkflowPhase::Failed, PodGcStrategy::OnPodNone);
        assert_eq!(
            actions(Some(&wf), &pod(PodPhase::Running)),
            vec![PodCleanupAction::TerminateContainers]
        );
        let running = workflow(WorkflowPhase::Running, PodGcStrategy::OnPodNone);
        assert!(actions(Some(&running), &pod(PodPhase::Running)).is_empty());
    }

    #[test]
    fn test_orphan_waits_from_last_transition() {
        let now = Utc::now();
        let mut p = pod(PodPhase::Succeeded);
        p.metadata.finalizers = vec![FINALIZER_POD_STATUS.to_string()];
        p.status.conditions = vec![PodCondition {
            condition_type: "Ready".to_string(),
            last_transition_time: Some(now - chrono::Duration::seconds(2)),
            ..Default::default()
        }];
        p.metadata.annotations.insert(
            ANNOTATION_KEY_POD_GC_STRATEGY.to_string(),
            "OnPodCompletion/".to_string(),
        );
        let planned = cleanup_actions(&Settings::default(), None, &p, now);
        assert_eq!(planned[0], (PodCleanupAction::RemoveFinalizer, Duration::ZERO));
        assert_eq!(planned[1], (PodCleanupAction::DeletePod, Duration::from_secs(3)));
    }

    #[test]
    fn test_strategy_none_never_deletes_orphans() {
        let mut annotated = pod(PodPhase::Succeeded);
        annotated.metadata.annotations.insert(
            ANNOTATION_KEY_POD_GC_STRATEGY.to_string(),
            "OnPodNone/".to_string(),
        );
        assert!(actions(None, &annotated).is_empty());
        // pods without the annotation default to no GC
        assert!(actions(None, &pod(PodPhase::Failed)).is_empty());

        let mut deleting = workflow(WorkflowPhase::Succeeded, PodGcStrategy::OnPodNone);
        deleting.metadata.deletion_timestamp = Some(Utc::now());
        assert!(!actions(Some(&deleting), &annotated).contains(&PodCleanupAction::DeletePod));
    }

    #[test]
    fn test_orphan_pod_success_strategy_keeps_failed_pods() {
        let annotate = |phase| {
            let mut p = pod(phase);
            p.metadata.annotations.insert(
                ANNOTATION_KEY_POD_GC_STRATEGY.to_string(),
                "OnPodSuccess/".to_string(),
            );
            p
        };
        assert!(actions(None, &annotate(PodPhase::Failed)).is_empty());
        assert_eq!(actions(None, &annotate(PodPhase::Succeeded)), vec![PodCleanupAction::DeletePod]);
    }

    #[test]
    fn test_finalizer_of_deleted_pod_removed_after_minimum_delay() {
        let now = Utc::now();
        let wf = workflow(WorkflowPhase::Running, PodGcStrategy::OnPodCompletion);
        let mut p = pod(PodPhase::Succeeded);
        p.metadata.finalizers = vec![FINALIZER_POD_STATUS.to_string()];
        p.metadata.deletion_timestamp = Some(now);
        p.status.conditions = vec![PodCondition {
            condition_type: "Ready".to_string(),
            last_transition_time: Some(now - chrono::Duration::seconds(20)),
            ..Default::default()
        }];
        for owner in [Some(&wf), None] {
            assert_eq!(
                cleanup_actions(&Settings::default(), owner, &p, now),
                vec![(PodCleanupAction::RemoveFinalizer, Duration::from_secs(100))]
            );
        }

        p.metadata.finalizers.clear();
        assert!(actions(Some(&wf), &p).is_empty());
    }

    #[test]
    fn test_significant_change() {
        let old = pod(PodPhase::Running);
        let mut new = old.clone();
        assert!(!significant_pod_change(&old, &new, false));
        assert!(significant_pod_change(&old, &new, true));
        new.status.container_statuses.push(ContainerStatus {
            name: "main".to_string(),
            ready: false,
            state: ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            },
        });
        assert!(significant_pod_change(&old, &new, false));
        let mut ready = new.clone();
        ready.status.container_statuses[0].ready = true;
        assert!(significant_pod_change(&new, &ready, false));
        let mut start_time = ready.clone();
        start_time.status.start_time = Some(Utc::now());
        assert!(!significant_pod_change(&ready, &start_time, false));
    }

    #[tokio::test]
    async fn test_process_label_delete_and_terminate() {
        let cluster = Arc::new(InMemoryCluster::new());
        let client: SharedClient = cluster.clone();
        let queue = WorkQueue::new();
        let cleaner = PodCleaner::new(client.clone(), queue.clone(), &Settings::default());
        let pods: Api<Pod> = Api::namespaced(client, "argo");

        let mut p = pod(PodPhase::Running);
        p.metadata.finalizers = vec![FINALIZER_POD_STATUS.to_string()];
        p.status.container_statuses = ["main", "wait"]
            .iter()
            .map(|name| ContainerStatus {
                name: name.to_string(),
                ready: true,
                state: ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..Default::default()
                },
            })
            .collect();
        pods.create(&p).await.unwrap();

        let terminate = PodCleanupKey::new("argo", "wf-1234", PodCleanupAction::TerminateContainers);
        cleaner.process(&terminate).await.unwrap();
        let log = cluster.exec_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].container, "main");
        assert_eq!(log[0].argv, vec!["kill", "-s", "TERM", "1"]);
        let kill = PodCleanupKey::new("argo", "wf-1234", PodCleanupAction::KillContainers);
        assert_eq!(queue.pending_delay(&kill).map(|d| d.as_secs() > 25), Some(true));

        let label = PodCleanupKey::new("argo", "wf-1234", PodCleanupAction::LabelPodCompleted);
        cleaner.process(&label).await.unwrap();
        let labelled = pods.get("wf-1234").await.unwrap();
        assert_eq!(labelled.metadata.label(LABEL_KEY_COMPLETED), Some("true"));
        assert!(labelled.metadata.finalizers.is_empty());

        let delete = PodCleanupKey::new("argo", "wf-1234", PodCleanupAction::DeletePod);
        cleaner.process(&delete).await.unwrap();
        assert!(pods.get_opt("wf-1234").await.unwrap().is_none());
        // idempotent once the pod is gone
        cleaner.process(&delete).await.unwrap();
        cleaner.process(&label).await.unwrap();
    }
}
