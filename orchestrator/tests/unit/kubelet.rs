//! Simulated kubelet: runs pod main containers through the emissary

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use argoflow::app::options::ExecutorOptions;
use argoflow::cluster::{Api, InMemoryCluster, ListParams, SharedClient};
use argoflow::controller::Controller;
use argoflow::executor::emissary;
use argoflow::storage::layout::{ExecutorLayout, VarRunArgo};
use serde_json::json;
use workflow_api::common::{
    ANNOTATION_KEY_NODE_NAME, ENV_VAR_INCLUDE_SCRIPT_OUTPUT, ENV_VAR_TEMPLATE, LABEL_KEY_WORKFLOW,
};
use workflow_api::{ObjectMeta, Pod, PodPhase, Workflow};

pub struct Kubelet {
    pub cluster: Arc<InMemoryCluster>,
    pub root: PathBuf,
}

impl Kubelet {
    pub fn new(cluster: Arc<InMemoryCluster>, root: &Path) -> Self {
        Self {
            cluster,
            root: root.to_path_buf(),
        }
    }

    pub fn pods(&self) -> Api<Pod> {
        let client: SharedClient = self.cluster.clone();
        Api::namespaced(client, "argo")
    }

    /// Shared volume of one pod
    pub fn var_run_argo(&self, pod: &str) -> VarRunArgo {
        VarRunArgo::new(self.root.join(pod).join("var/run/argo"))
    }

    fn options(&self, pod: &Pod) -> ExecutorOptions {
        let main = pod
            .spec
            .containers
            .iter()
            .find(|c| c.name == "main")
            .expect("pod has a main container");
        let mut options = ExecutorOptions {
            var_run_argo: self.var_run_argo(&pod.metadata.name),
            layout: ExecutorLayout::rooted(&self.root.join(&pod.metadata.name)),
            dependency_poll_interval: Duration::from_millis(20),
            signal_poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        options.env.container_name = "main".to_string();
        options.env.namespace = "argo".to_string();
        options.env.pod_name = pod.metadata.name.clone();
        options.env.template = main.env_value(ENV_VAR_TEMPLATE).map(str::to_string);
        options.env.include_script_output = main.env_value(ENV_VAR_INCLUDE_SCRIPT_OUTPUT) == Some("true");
        options
    }

    /// Run the main container of `pod` and report its exit as the pod status
    pub async fn run(&self, pod: &Pod) -> i32 {
        let main = pod
            .spec
            .containers
            .iter()
            .find(|c| c.name == "main")
            .expect("pod has a main container");
        let argv: Vec<String> = main
            .argv()
            .into_iter()
            .skip_while(|arg| arg != "--")
            .collect();
        let code = emissary::run(&self.options(pod), &argv).await;
        self.finish(&pod.metadata.name, code).await;
        code
    }

    /// Mark a pod finished with the given main exit code without running it
    pub async fn finish(&self, pod: &str, code: i32) {
        let phase = if code == 0 { "Succeeded" } else { "Failed" };
        self.pods()
            .patch(
                pod,
                &json!({"status": {
                    "phase": phase,
                    "containerStatuses": [
                        {"name": "main", "state": {"terminated": {"exitCode": code}}},
                        {"name": "wait", "state": {"terminated": {"exitCode": 0}}}
                    ]
                }}),
            )
            .await
            .unwrap();
    }

    /// Pods of `workflow` that have not finished yet
    pub async fn pending_pods(&self, workflow: &str) -> Vec<Pod> {
        self.pods()
            .list(&ListParams::default().labels(LABEL_KEY_WORKFLOW, workflow))
            .await
            .unwrap()
            .into_iter()
            .filter(|p| !matches!(p.status.phase, PodPhase::Succeeded | PodPhase::Failed))
            .collect()
    }
}

pub fn node_name(pod: &Pod) -> String {
    pod.metadata
        .annotation(ANNOTATION_KEY_NODE_NAME)
        .unwrap_or_default()
        .to_string()
}

pub fn workflow(name: &str, spec: serde_json::Value) -> Workflow {
    Workflow {
        metadata: ObjectMeta::named("argo", name),
        spec: serde_json::from_value(spec).unwrap(),
        ..Default::default()
    }
}

/// Reconcile until the workflow completes, letting `decide` settle each new pod
pub async fn drive<F, Fut>(ctrl: &Controller, kubelet: &Kubelet, name: &str, mut decide: F) -> Workflow
where
    F: FnMut(Pod) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let key = format!("argo/{}", name);
    let workflows: Api<Workflow> = Api::namespaced(kubelet.cluster.clone(), "argo");
    for _ in 0..20 {
        ctrl.reconcile(&key).await.unwrap();
        let wf = workflows.get(name).await.unwrap();
        if wf.labelled_completed() {
            return wf;
        }
        for pod in kubelet.pending_pods(name).await {
            decide(pod).await;
        }
    }
    panic!("workflow {} did not complete", name);
}
