//! Workflow controller
//!
//! Informers keep local stores of workflows, pods, task results and task
//! sets. Their handlers only enqueue keys; the worker pools drain the queues
//! through [`Controller::reconcile`], [`PodCleaner::process`] and
//! [`TtlCollector::process`]. A reconcile loads what the operator needs,
//! runs one pass and applies the outcome.

pub mod archive;
pub mod depends;
pub mod estimation;
pub mod object_store;
pub mod offload;
pub mod operator;
pub mod pod_cleanup;
pub mod pod_spec;
pub mod retention;
pub mod scope;
pub mod semaphore;
pub mod template_ref;
pub mod ttl;
pub mod validate;
pub mod workqueue;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use workflow_api::common::{LABEL_KEY_COMPLETED, LABEL_KEY_CONTROLLER_INSTANCE_ID, LABEL_KEY_WORKFLOW};
use workflow_api::meta::split_key;
use workflow_api::{
    NodePhase, Nodes, ObjectMeta, Pod, Workflow, WorkflowPhase, WorkflowSpec, WorkflowTaskResult,
    WorkflowTaskSet,
};

use self::archive::{ArchiveRepo, ObjectStoreArchive};
use self::estimation::{baseline_label, pick_baseline, Estimator};
use self::object_store::ObjectStore;
use self::offload::{ObjectStoreOffload, OffloadRepo};
use self::operator::{Operator, OperatorInputs, Outcome};
use self::pod_cleanup::{enqueue_pod, significant_pod_change, PodCleaner, PodCleanupAction, PodCleanupKey};
use self::pod_spec::{agent_pod_name, build_agent_pod, workflow_owner_reference};
use self::semaphore::{lock_for, SemaphoreManager};
use self::ttl::TtlCollector;
use self::workqueue::WorkQueue;
use crate::app::env::ControllerEnv;
use crate::clock::SharedClock;
use crate::cluster::{Api, DeleteOptions, Informer, ListParams, SharedClient, WatchEvent};
use crate::errors::WfError;
use crate::storage::settings::Settings;
use crate::utils::parse_duration;

/// Safety-net requeue for workflows that are still running
const RUNNING_REQUEUE: Duration = Duration::from_secs(30);

/// Poll interval for lock waiters when waiters are not indexed
const LOCK_POLL: Duration = Duration::from_secs(10);

pub struct Controller {
    client: SharedClient,
    settings: Settings,
    clock: SharedClock,
    queue: WorkQueue<String>,
    pod_cleaner: PodCleaner,
    ttl: TtlCollector,
    workflows: Informer<Workflow>,
    pods: Informer<Pod>,
    task_results: Informer<WorkflowTaskResult>,
    task_sets: Informer<WorkflowTaskSet>,
    semaphores: Arc<SemaphoreManager>,
    index_lock_waiters: bool,
    offload: Option<Arc<dyn OffloadRepo>>,
    archive: Option<Arc<dyn ArchiveRepo>>,
}

impl Controller {
    pub fn new(client: SharedClient, settings: Settings, env: ControllerEnv, clock: SharedClock) -> Arc<Self> {
        let offload: Option<Arc<dyn OffloadRepo>> = settings.node_status_offload.enabled.then(|| {
            let store = ObjectStore::on_volume(Path::new(&settings.node_status_offload.dir), "offload");
            Arc::new(ObjectStoreOffload::new(store, &settings.cluster.name, clock.clone())) as Arc<dyn OffloadRepo>
        });
        let archive: Option<Arc<dyn ArchiveRepo>> = settings.archive.enabled.then(|| {
            let store = ObjectStore::on_volume(Path::new(&settings.archive.dir), "archive");
            Arc::new(ObjectStoreArchive::new(store, &settings.cluster.name)) as Arc<dyn ArchiveRepo>
        });
        Self::with_repos(client, settings, env, clock, offload, archive)
    }

    /// Controller with explicit offload and archive repositories
    pub fn with_repos(
        client: SharedClient,
        settings: Settings,
        env: ControllerEnv,
        clock: SharedClock,
        offload: Option<Arc<dyn OffloadRepo>>,
        archive: Option<Arc<dyn ArchiveRepo>>,
    ) -> Arc<Self> {
        let mut params = ListParams::default();
        if !settings.instance_id.is_empty() {
            params = params.labels(LABEL_KEY_CONTROLLER_INSTANCE_ID, &settings.instance_id);
        }
        let namespace = settings.namespace.clone();
        let queue = WorkQueue::new();
        let controller = Self {
            pod_cleaner: PodCleaner::new(client.clone(), WorkQueue::new(), &settings),
            ttl: TtlCollector::new(client.clone(), WorkQueue::new(), clock.clone()),
            workflows: Informer::new(Api::namespaced(client.clone(), &namespace), params.clone()),
            pods: Informer::new(Api::namespaced(client.clone(), &namespace), params),
            task_results: Informer::new(Api::namespaced(client.clone(), &namespace), ListParams::default()),
            task_sets: Informer::new(Api::namespaced(client.clone(), &namespace), ListParams::default()),
            semaphores: Arc::new(SemaphoreManager::new(env.index_workflow_semaphore_keys)),
            index_lock_waiters: env.index_workflow_semaphore_keys,
            client,
            settings,
            clock,
            queue,
            offload,
            archive,
        };
        controller.register_handlers(env.all_pod_changes_significant);
        Arc::new(controller)
    }

    fn register_handlers(&self, all_pod_changes_significant: bool) {
        let queue = self.queue.clone();
        let ttl = self.ttl.clone();
        let semaphores = self.semaphores.clone();
        let cleanup = self.pod_cleaner.queue().clone();
        let pod_store = self.pods.store();
        let settings = self.settings.clone();
        let clock = self.clock.clone();
        self.workflows.add_handler(move |event: &WatchEvent<Workflow>| match event {
            WatchEvent::Added(wf) | WatchEvent::Updated { new: wf, .. } => {
                if wf.labelled_completed() {
                    ttl.enqueue(wf);
                } else {
                    queue.add(wf.metadata.key());
                }
            }
            WatchEvent::Deleted(wf) => {
                let key = wf.metadata.key();
                if let Some((lock, _)) = lock_for(wf) {
                    for waiter in semaphores.release(&lock, &key) {
                        queue.add(waiter);
                    }
                }
                let now = clock.now();
                for pod in pod_store.list().iter().filter(|p| {
                    p.metadata.namespace == wf.namespace() && p.metadata.label(LABEL_KEY_WORKFLOW) == Some(wf.name())
                }) {
                    enqueue_pod(&cleanup, &settings, None, pod, now);
                }
            }
        });

        let queue = self.queue.clone();
        let cleanup = self.pod_cleaner.queue().clone();
        let wf_store = self.workflows.store();
        let settings = self.settings.clone();
        let clock = self.clock.clone();
        self.pods.add_handler(move |event: &WatchEvent<Pod>| {
            let (pod, significant) = match event {
                WatchEvent::Added(pod) | WatchEvent::Deleted(pod) => (pod, true),
                WatchEvent::Updated { old, new } => (new, significant_pod_change(old, new, all_pod_changes_significant)),
            };
            let Some(wf_name) = pod.metadata.label(LABEL_KEY_WORKFLOW) else {
                return;
            };
            if !significant {
                return;
            }
            let key = format!("{}/{}", pod.metadata.namespace, wf_name);
            queue.add(key.clone());
            if !matches!(event, WatchEvent::Deleted(_)) {
                let wf = wf_store.get(&key);
                enqueue_pod(&cleanup, &settings, wf.as_ref(), pod, clock.now());
            }
        });

        let queue = self.queue.clone();
        self.task_results.add_handler(move |event: &WatchEvent<WorkflowTaskResult>| {
            let result = match event {
                WatchEvent::Added(r) | WatchEvent::Deleted(r) | WatchEvent::Updated { new: r, .. } => r,
            };
            if let Some(wf_name) = result.metadata.label(LABEL_KEY_WORKFLOW) {
                queue.add(format!("{}/{}", result.metadata.namespace, wf_name));
            }
        });

        let queue = self.queue.clone();
        self.task_sets.add_handler(move |event: &WatchEvent<WorkflowTaskSet>| {
            if !matches!(event, WatchEvent::Deleted(_)) {
                queue.add(event.key());
            }
        });
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    pub fn pod_cleaner(&self) -> &PodCleaner {
        &self.pod_cleaner
    }

    pub fn ttl(&self) -> &TtlCollector {
        &self.ttl
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn semaphores(&self) -> &SemaphoreManager {
        &self.semaphores
    }

    pub fn workflow_informer(&self) -> &Informer<Workflow> {
        &self.workflows
    }

    pub fn pod_informer(&self) -> &Informer<Pod> {
        &self.pods
    }

    pub fn task_result_informer(&self) -> &Informer<WorkflowTaskResult> {
        &self.task_results
    }

    pub fn task_set_informer(&self) -> &Informer<WorkflowTaskSet> {
        &self.task_sets
    }

    /// Relist every informer once, dispatching events to the queues
    pub async fn sync_informers(&self) -> Result<(), WfError> {
        self.workflows.resync().await?;
        self.pods.resync().await?;
        self.task_results.resync().await?;
        self.task_sets.resync().await?;
        Ok(())
    }

    /// Stop handing out keys on every queue
    pub fn shut_down_queues(&self) {
        self.queue.shut_down();
        self.pod_cleaner.queue().shut_down();
        self.ttl.queue().shut_down();
    }

    // ====== RECONCILE ====== //

    /// One reconciliation of the workflow behind `key`
    ///
    /// Returns how long to wait before the workflow should be looked at
    /// again, if at all.
    pub async fn reconcile(&self, key: &str) -> Result<Option<Duration>, WfError> {
        let (namespace, name) = split_key(key);
        let workflows: Api<Workflow> = Api::namespaced(self.client.clone(), namespace);
        let Some(stored) = workflows.get_opt(name).await? else {
            debug!(workflow = key, "workflow no longer exists");
            return Ok(None);
        };
        if stored.labelled_completed() {
            self.ttl.enqueue(&stored);
            return Ok(None);
        }

        let now = self.clock.now();
        let mut wf = stored.clone();
        self.hydrate(&mut wf).await?;

        if !wf.completed() && !self.acquire_lock(&mut wf) {
            if wf != stored {
                self.persist(&workflows, &stored, wf).await?;
            }
            return Ok((!self.index_lock_waiters).then_some(LOCK_POLL));
        }

        let spec = match template_ref::effective_spec(&self.client, &wf).await {
            Ok(spec) => spec,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                fail_workflow(&mut wf, &e.message(), now);
                wf.spec.clone()
            }
        };
        let inputs = self.load_inputs(&wf, spec).await?;
        let had_http_tasks = inputs.task_set.is_some();
        let pods = inputs.pods.clone();

        let (mut next, outcome) = Operator::new(&self.settings, wf, inputs, now).operate();
        let requeue_after = outcome.requeue_after;
        let mut retry_soon = self.apply_outcome(&mut next, outcome, now).await?;

        if next.completed() {
            retry_soon |= !self.complete(&mut next, &pods, had_http_tasks).await;
        }
        self.offload_nodes(&mut next).await?;
        if next != stored {
            self.persist(&workflows, &stored, next.clone()).await?;
        }
        if next.labelled_completed() {
            self.ttl.enqueue(&next);
            return Ok(None);
        }

        let mut delay = requeue_after.unwrap_or(RUNNING_REQUEUE).min(RUNNING_REQUEUE);
        if retry_soon {
            delay = delay.min(Duration::from_secs(1));
        }
        Ok(Some(delay))
    }

    /// Bring back an offloaded node map
    async fn hydrate(&self, wf: &mut Workflow) -> Result<(), WfError> {
        let Some(version) = wf.status.offload_node_status_version.clone() else {
            return Ok(());
        };
        let Some(offload) = &self.offload else {
            return Err(WfError::Internal(format!(
                "workflow {} has offloaded node status but offloading is disabled",
                wf.metadata.key()
            )));
        };
        wf.status.nodes = offload.get(wf.uid(), &version).await?;
        debug!(workflow = %wf.metadata.key(), version, "hydrated node status");
        Ok(())
    }

    /// Take the workflow's lock; `false` leaves it Pending with a waiting message
    fn acquire_lock(&self, wf: &mut Workflow) -> bool {
        let Some((lock, limit)) = lock_for(wf) else {
            return true;
        };
        if self.semaphores.try_acquire(&lock, limit, &wf.metadata.key()) {
            return true;
        }
        wf.status.phase = WorkflowPhase::Pending;
        wf.status.message = format!("Waiting for {} lock", lock);
        false
    }

    async fn load_inputs(&self, wf: &Workflow, spec: WorkflowSpec) -> Result<OperatorInputs, WfError> {
        let namespace = wf.namespace();
        let selector = ListParams::default().labels(LABEL_KEY_WORKFLOW, wf.name());
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let results: Api<WorkflowTaskResult> = Api::namespaced(self.client.clone(), namespace);
        let task_sets: Api<WorkflowTaskSet> = Api::namespaced(self.client.clone(), namespace);

        let estimator = if matches!(wf.status.phase, WorkflowPhase::Unknown | WorkflowPhase::Pending) {
            self.estimator_for(wf).await
        } else {
            Estimator::default()
        };
        Ok(OperatorInputs {
            spec,
            pods: pods.list(&selector).await?,
            task_results: results.list(&selector).await?,
            task_set: task_sets.get_opt(wf.name()).await?,
            estimator,
        })
    }

    /// Estimator backed by the latest successful run of the same family
    async fn estimator_for(&self, wf: &Workflow) -> Estimator {
        let Some((label, value)) = baseline_label(wf) else {
            return Estimator::default();
        };
        let api: Api<Workflow> = Api::namespaced(self.client.clone(), wf.namespace());
        match api.list(&ListParams::default().labels(label, &value)).await {
            Ok(candidates) => Estimator::new(pick_baseline(wf, candidates)),
            Err(e) => {
                warn!(workflow = %wf.metadata.key(), "failed to look up baseline workflow: {}", e);
                Estimator::default()
            }
        }
    }

    /// Create pods and agent tasks, queue terminations; `true` asks for a quick retry
    async fn apply_outcome(&self, wf: &mut Workflow, outcome: Outcome, now: DateTime<Utc>) -> Result<bool, WfError> {
        let key = wf.metadata.key();
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), wf.namespace());
        let mut retry_soon = false;

        for pod in &outcome.pods {
            match pods.create(pod).await {
                Ok(_) => info!(workflow = %key, pod = %pod.metadata.name, "created pod"),
                Err(e) if e.is_conflict() => debug!(workflow = %key, pod = %pod.metadata.name, "pod already exists"),
                Err(e) if e.is_transient() => {
                    warn!(workflow = %key, pod = %pod.metadata.name, "failed to create pod: {}", e);
                    retry_soon = true;
                }
                Err(e) => {
                    error!(workflow = %key, pod = %pod.metadata.name, "failed to create pod: {}", e);
                    if let Some(node) = wf.status.nodes.get_mut(&pod.metadata.name) {
                        node.mark_phase(NodePhase::Error, &e.message(), now);
                    }
                    retry_soon = true;
                }
            }
        }

        if !outcome.http_tasks.is_empty() {
            self.upsert_task_set(wf, &outcome).await?;
            match pods.create(&build_agent_pod(&self.settings, wf)).await {
                Ok(_) => info!(workflow = %key, "created agent pod"),
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }

        for name in &outcome.terminate {
            let cleanup = PodCleanupKey::new(wf.namespace(), name, PodCleanupAction::TerminateContainers);
            debug!(workflow = %key, pod = %name, "queueing container termination");
            self.pod_cleaner.queue().add(cleanup);
        }
        Ok(retry_soon)
    }

    async fn upsert_task_set(&self, wf: &Workflow, outcome: &Outcome) -> Result<(), WfError> {
        let api: Api<WorkflowTaskSet> = Api::namespaced(self.client.clone(), wf.namespace());
        match api.get_opt(wf.name()).await? {
            Some(existing) => {
                let missing: Vec<&String> = outcome
                    .http_tasks
                    .keys()
                    .filter(|id| !existing.spec.tasks.contains_key(*id))
                    .collect();
                if missing.is_empty() {
                    return Ok(());
                }
                let patch = serde_json::json!({ "spec": { "tasks": outcome.http_tasks } });
                api.patch(wf.name(), &patch).await?;
            }
            None => {
                let mut metadata = ObjectMeta::named(wf.namespace(), wf.name());
                metadata
                    .labels
                    .insert(LABEL_KEY_WORKFLOW.to_string(), wf.name().to_string());
                metadata.owner_references.push(workflow_owner_reference(wf));
                let mut task_set = WorkflowTaskSet::new(metadata);
                task_set.spec.tasks = outcome.http_tasks.clone();
                api.create(&task_set).await?;
            }
        }
        debug!(workflow = %wf.metadata.key(), tasks = outcome.http_tasks.len(), "updated task set");
        Ok(())
    }

    /// Work done once when a workflow completes; `false` if something must be retried
    async fn complete(&self, wf: &mut Workflow, pods: &[Pod], had_http_tasks: bool) -> bool {
        let key = wf.metadata.key();
        let mut done = true;
        let now = self.clock.now();
        for pod in pods {
            enqueue_pod(self.pod_cleaner.queue(), &self.settings, Some(wf), pod, now);
        }
        if had_http_tasks {
            let api: Api<Pod> = Api::namespaced(self.client.clone(), wf.namespace());
            match api.delete(&agent_pod_name(wf), &DeleteOptions::background()).await {
                Ok(()) => debug!(workflow = %key, "deleted agent pod"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(workflow = %key, "failed to delete agent pod: {}", e),
            }
        }
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.archive(wf).await {
                error!(workflow = %key, "failed to archive workflow: {}", e);
                done = false;
            } else {
                info!(workflow = %key, "archived workflow");
            }
        }
        if let Some((lock, _)) = lock_for(wf) {
            for waiter in self.semaphores.release(&lock, &key) {
                self.queue.add(waiter);
            }
        }
        if done {
            wf.metadata
                .labels
                .insert(LABEL_KEY_COMPLETED.to_string(), "true".to_string());
            info!(
                workflow = %key,
                phase = wf.status.phase.as_str(),
                message = %wf.status.message,
                "workflow completed"
            );
        }
        done
    }

    /// Move an oversized node map out of the workflow object
    async fn offload_nodes(&self, wf: &mut Workflow) -> Result<(), WfError> {
        let Some(offload) = &self.offload else {
            return Ok(());
        };
        let size = serde_json::to_vec(&wf.status.nodes)?.len();
        if size <= self.settings.node_status_offload.max_size {
            wf.status.offload_node_status_version = None;
            return Ok(());
        }
        let version = offload.save(wf.uid(), wf.namespace(), &wf.status.nodes).await?;
        debug!(workflow = %wf.metadata.key(), size, version, "offloaded node status");
        wf.status.offload_node_status_version = Some(version);
        wf.status.nodes = Nodes::new();
        Ok(())
    }

    async fn persist(&self, api: &Api<Workflow>, stored: &Workflow, mut wf: Workflow) -> Result<(), WfError> {
        wf.metadata.resource_version = stored.metadata.resource_version.clone();
        match api.update(&wf).await {
            Ok(updated) => {
                self.workflows.store().upsert(updated);
                Ok(())
            }
            Err(e) if e.is_conflict() => Err(WfError::Transient(format!(
                "workflow {} changed while reconciling: {}",
                stored.metadata.key(),
                e.message()
            ))),
            Err(e) => Err(e),
        }
    }

    // ====== GARBAGE COLLECTION ====== //

    /// Apply the retention policy once; returns the number of deleted workflows
    pub async fn enforce_retention(&self) -> Result<usize, WfError> {
        let Some(policy) = &self.settings.retention_policy else {
            return Ok(0);
        };
        retention::enforce(&self.client, &self.settings.namespace, policy).await
    }

    /// Delete offloaded node maps older than `ttl` that no live workflow uses
    pub async fn collect_offloads(&self, ttl: Duration) -> Result<usize, WfError> {
        let Some(offload) = &self.offload else {
            return Ok(0);
        };
        let api: Api<Workflow> = Api::namespaced(self.client.clone(), &self.settings.namespace);
        let live: BTreeSet<(String, String)> = api
            .list(&ListParams::default())
            .await?
            .into_iter()
            .filter_map(|wf| {
                let version = wf.status.offload_node_status_version.clone()?;
                Some((wf.metadata.uid, version))
            })
            .collect();
        let older_than = self.clock.now() - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut deleted = 0;
        for record in offload.list_old_offloads(older_than).await? {
            if live.contains(&(record.uid.clone(), record.version.clone())) {
                continue;
            }
            match offload.delete(&record.uid, &record.version).await {
                Ok(()) => {
                    debug!(uid = %record.uid, version = %record.version, "deleted old offload");
                    deleted += 1;
                }
                Err(e) => warn!(uid = %record.uid, version = %record.version, "failed to delete offload: {}", e),
            }
        }
        Ok(deleted)
    }

    /// Delete archived workflows older than the archive TTL
    pub async fn collect_archives(&self) -> Result<usize, WfError> {
        let Some(archive) = &self.archive else {
            return Ok(0);
        };
        let Some(ttl) = self.settings.archive.ttl.as_deref().filter(|t| !t.is_empty()) else {
            return Ok(0);
        };
        let ttl = chrono::Duration::from_std(parse_duration(ttl)?)
            .map_err(|e| WfError::BadRequest(format!("invalid archive ttl: {}", e)))?;
        archive.delete_expired(self.clock.now() - ttl).await
    }
}

/// Fail a workflow that cannot be started
fn fail_workflow(wf: &mut Workflow, message: &str, now: DateTime<Utc>) {
    warn!(workflow = %wf.metadata.key(), message, "failing workflow");
    wf.status.phase = WorkflowPhase::Failed;
    wf.status.message = message.to_string();
    wf.status.started_at.get_or_insert(now);
    wf.status.finished_at.get_or_insert(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::InMemoryCluster;
    use serde_json::json;
    use workflow_api::PodPhase;

    fn controller(cluster: &Arc<InMemoryCluster>, settings: Settings) -> Arc<Controller> {
        controller_at(cluster, settings, ManualClock::default())
    }

    fn controller_at(cluster: &Arc<InMemoryCluster>, settings: Settings, clock: ManualClock) -> Arc<Controller> {
        let client: SharedClient = cluster.clone();
        Controller::new(client, settings, ControllerEnv::default(), Arc::new(clock))
    }

    fn workflow(name: &str, spec: serde_json::Value) -> Workflow {
        Workflow {
            metadata: ObjectMeta::named("argo", name),
            spec: serde_json::from_value(spec).unwrap(),
            ..Default::default()
        }
    }

    fn hello() -> serde_json::Value {
        json!({
            "entrypoint": "main",
            "templates": [{"name": "main", "container": {"image": "alpine", "command": ["echo"]}}]
        })
    }

    #[tokio::test]
    async fn test_reconcile_creates_pod_and_completes() {
        let cluster = Arc::new(InMemoryCluster::new());
        let ctrl = controller(&cluster, Settings::default());
        let workflows: Api<Workflow> = Api::namespaced(cluster.clone(), "argo");
        let pods: Api<Pod> = Api::namespaced(cluster.clone(), "argo");
        workflows.create(&workflow("hello", hello())).await.unwrap();

        let requeue = ctrl.reconcile("argo/hello").await.unwrap();
        assert!(requeue.is_some());
        let wf = workflows.get("hello").await.unwrap();
        assert_eq!(wf.status.phase, WorkflowPhase::Running);
        let pod = pods.get("hello").await.unwrap();
        assert_eq!(pod.metadata.label(LABEL_KEY_WORKFLOW), Some("hello"));

        pods.patch("hello", &json!({"status": {"phase": "Succeeded"}})).await.unwrap();
        assert_eq!(ctrl.reconcile("argo/hello").await.unwrap(), None);
        let wf = workflows.get("hello").await.unwrap();
        assert_eq!(wf.status.phase, WorkflowPhase::Succeeded);
        assert!(wf.labelled_completed());
        assert!(wf.status.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_template_ref_fails_workflow() {
        let cluster = Arc::new(InMemoryCluster::new());
        let ctrl = controller(&cluster, Settings::default());
        let workflows: Api<Workflow> = Api::namespaced(cluster.clone(), "argo");
        workflows
            .create(&workflow("ref", json!({"workflowTemplateRef": {"name": "nope"}})))
            .await
            .unwrap();
        ctrl.reconcile("argo/ref").await.unwrap();
        let wf = workflows.get("ref").await.unwrap();
        assert_eq!(wf.status.phase, WorkflowPhase::Failed);
        assert_eq!(wf.status.message, "workflow template nope not found");
    }

    #[tokio::test]
    async fn test_mutex_serializes_workflows() {
        let cluster = Arc::new(InMemoryCluster::new());
        let ctrl = controller(&cluster, Settings::default());
        let workflows: Api<Workflow> = Api::namespaced(cluster.clone(), "argo");
        let pods: Api<Pod> = Api::namespaced(cluster.clone(), "argo");
        let mut spec = hello();
        spec["synchronization"] = json!({"mutex": {"name": "one"}});
        workflows.create(&workflow("first", spec.clone())).await.unwrap();
        workflows.create(&workflow("second", spec)).await.unwrap();

        ctrl.reconcile("argo/first").await.unwrap();
        ctrl.reconcile("argo/second").await.unwrap();
        let second = workflows.get("second").await.unwrap();
        assert_eq!(second.status.phase, WorkflowPhase::Pending);
        assert_eq!(second.status.message, "Waiting for argo/one lock");

        pods.patch("first", &json!({"status": {"phase": "Succeeded"}})).await.unwrap();
        ctrl.reconcile("argo/first").await.unwrap();
        assert_eq!(ctrl.semaphores().holders("argo/one"), Vec::<String>::new());
        ctrl.reconcile("argo/second").await.unwrap();
        let second = workflows.get("second").await.unwrap();
        assert_eq!(second.status.phase, WorkflowPhase::Running);
    }

    #[tokio::test]
    async fn test_large_node_status_is_offloaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.node_status_offload.enabled = true;
        settings.node_status_offload.max_size = 10;
        settings.node_status_offload.dir = dir.path().to_string_lossy().to_string();
        let clock = ManualClock::default();
        let cluster = Arc::new(InMemoryCluster::new());
        let ctrl = controller_at(&cluster, settings, clock.clone());
        let workflows: Api<Workflow> = Api::namespaced(cluster.clone(), "argo");
        let pods: Api<Pod> = Api::namespaced(cluster.clone(), "argo");
        workflows.create(&workflow("big", hello())).await.unwrap();

        ctrl.reconcile("argo/big").await.unwrap();
        let wf = workflows.get("big").await.unwrap();
        assert!(wf.status.nodes.is_empty());
        assert!(wf.status.offload_node_status_version.is_some());

        let mut pod = pods.get("big").await.unwrap();
        pod.status.phase = PodPhase::Succeeded;
        pods.update(&pod).await.unwrap();
        ctrl.reconcile("argo/big").await.unwrap();
        let wf = workflows.get("big").await.unwrap();
        assert_eq!(wf.status.phase, WorkflowPhase::Succeeded);
        clock.advance(chrono::Duration::minutes(10));
        assert_eq!(ctrl.collect_offloads(Duration::from_secs(60)).await.unwrap(), 1);
    }
}
