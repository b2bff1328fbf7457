//! Workflows driven end to end against the in-memory cluster

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use argoflow::app::env::ControllerEnv;
use argoflow::clock;
use argoflow::cluster::InMemoryCluster;
use argoflow::controller::pod_cleanup::{PodCleanupAction, PodCleanupKey};
use argoflow::controller::Controller;
use argoflow::filesys::archive::read_single_entry;
use argoflow::storage::settings::Settings;
use argoflow::template;
use serde_json::json;
use workflow_api::common::LABEL_KEY_COMPLETED;
use workflow_api::{NodePhase, Pod, WorkflowPhase};

use crate::kubelet::{drive, node_name, workflow, Kubelet};

fn setup() -> (Arc<InMemoryCluster>, Arc<Controller>, tempfile::TempDir) {
    let cluster = Arc::new(InMemoryCluster::new());
    let ctrl = Controller::new(
        cluster.clone(),
        Settings::default(),
        ControllerEnv::default(),
        clock::system(),
    );
    (cluster, ctrl, tempfile::tempdir().unwrap())
}

async fn create(cluster: &Arc<InMemoryCluster>, wf: &workflow_api::Workflow) {
    let api: argoflow::cluster::Api<workflow_api::Workflow> =
        argoflow::cluster::Api::namespaced(cluster.clone(), "argo");
    api.create(wf).await.unwrap();
}

fn shell(name: &str, script: &str) -> serde_json::Value {
    json!({
        "name": name,
        "container": {"image": "alpine", "command": ["sh", "-c", script]}
    })
}

#[tokio::test]
async fn test_stdout_is_captured() {
    let (cluster, ctrl, dir) = setup();
    let kubelet = Kubelet::new(cluster.clone(), dir.path());
    let mut template = shell("main", "echo hello > /dev/stdout");
    template["includeScriptOutput"] = json!(true);
    create(&cluster, &workflow("hello", json!({"entrypoint": "main", "templates": [template]}))).await;

    let k = &kubelet;
    let done = drive(&ctrl, &kubelet, "hello", move |pod: Pod| async move {
        assert_eq!(k.run(&pod).await, 0);
    })
    .await;

    let ctr = kubelet.var_run_argo("hello");
    let stdout = ctr.stdout_file("main").read_string().await.unwrap();
    assert!(stdout.contains("hello"));
    assert_eq!(ctr.exitcode_file("main").read_string().await.unwrap().trim(), "0");
    assert_eq!(done.status.phase, WorkflowPhase::Succeeded);
}

#[tokio::test]
async fn test_failing_container_fails_workflow() {
    let (cluster, ctrl, dir) = setup();
    let kubelet = Kubelet::new(cluster.clone(), dir.path());
    create(&cluster, &workflow("fail", json!({"entrypoint": "main", "templates": [shell("main", "exit 1")]}))).await;

    let k = &kubelet;
    let done = drive(&ctrl, &kubelet, "fail", move |pod: Pod| async move {
        assert_eq!(k.run(&pod).await, 1);
    })
    .await;

    let exitcode = kubelet.var_run_argo("fail").exitcode_file("main").read_string().await.unwrap();
    assert_eq!(exitcode.trim(), "1");
    let node = done.status.nodes.find_by_name("fail").unwrap();
    assert_eq!(node.phase, NodePhase::Failed);
    assert_eq!(done.status.phase, WorkflowPhase::Failed);
}

#[tokio::test]
async fn test_output_artifact_is_packed() {
    let (cluster, ctrl, dir) = setup();
    let kubelet = Kubelet::new(cluster.clone(), dir.path());
    let artifact = dir.path().join("work/artifact");
    let artifact = artifact.to_string_lossy().to_string();
    let mut template = shell("main", &format!("mkdir -p $(dirname {0}) && printf hello > {0}", artifact));
    template["outputs"] = json!({"artifacts": [{"name": "out", "path": artifact}]});
    create(&cluster, &workflow("art", json!({"entrypoint": "main", "templates": [template]}))).await;

    let k = &kubelet;
    drive(&ctrl, &kubelet, "art", move |pod: Pod| async move {
        k.run(&pod).await;
    })
    .await;

    let packed = kubelet.var_run_argo("art").output_artifact_file(&artifact);
    assert!(packed.path().to_string_lossy().ends_with("work/artifact.tgz"));
    assert_eq!(read_single_entry(packed.path()).unwrap(), b"hello");
}

#[tokio::test]
async fn test_output_parameter_is_copied() {
    let (cluster, ctrl, dir) = setup();
    let kubelet = Kubelet::new(cluster.clone(), dir.path());
    let parameter = dir.path().join("parameter").to_string_lossy().to_string();
    let mut template = shell("main", &format!("printf 'line one\\nline two' > {}", parameter));
    template["outputs"] = json!({"parameters": [{"name": "p", "valueFrom": {"path": parameter}}]});
    create(&cluster, &workflow("param", json!({"entrypoint": "main", "templates": [template]}))).await;

    let k = &kubelet;
    drive(&ctrl, &kubelet, "param", move |pod: Pod| async move {
        k.run(&pod).await;
    })
    .await;

    let copied = kubelet
        .var_run_argo("param")
        .output_parameter_file(&parameter)
        .read_bytes()
        .await
        .unwrap();
    assert_eq!(copied, b"line one\nline two");
}

fn diamond(name: &str) -> workflow_api::Workflow {
    workflow(
        name,
        json!({
            "entrypoint": "main",
            "templates": [
                {"name": "main", "dag": {"tasks": [
                    {"name": "A", "template": "step"},
                    {"name": "B", "template": "step", "depends": "A"},
                    {"name": "C", "template": "step", "depends": "A"},
                    {"name": "D", "template": "step", "depends": "A.Succeeded && (B.Succeeded || C.Succeeded)"}
                ]}},
                {"name": "step", "container": {"image": "alpine", "command": ["true"]}}
            ]
        }),
    )
}

/// Settle DAG pods without running them, failing the listed tasks
async fn settle_dag(name: &str, failing: &[&str]) -> workflow_api::Workflow {
    let (cluster, ctrl, dir) = setup();
    let kubelet = Kubelet::new(cluster.clone(), dir.path());
    create(&cluster, &diamond(name)).await;

    let failing: Vec<String> = failing.iter().map(|t| format!("{}.{}", name, t)).collect();
    let k = &kubelet;
    let failing = &failing;
    drive(&ctrl, &kubelet, name, move |pod: Pod| async move {
        let code = if failing.contains(&node_name(&pod)) { 1 } else { 0 };
        k.finish(&pod.metadata.name, code).await;
    })
    .await
}

#[tokio::test]
async fn test_dag_alternative_branch_succeeds() {
    let done = settle_dag("dia", &["C"]).await;
    let d = done.status.nodes.find_by_name("dia.D").unwrap();
    assert_eq!(d.phase, NodePhase::Succeeded);
    assert_eq!(
        done.status.nodes.find_by_name("dia.C").unwrap().phase,
        NodePhase::Failed
    );
    assert_eq!(done.status.phase, WorkflowPhase::Succeeded);
}

#[tokio::test]
async fn test_dag_both_branches_failed() {
    let done = settle_dag("dib", &["B", "C"]).await;
    let d = done.status.nodes.find_by_name("dib.D").unwrap();
    assert_eq!(d.phase, NodePhase::Skipped);
    assert_eq!(done.status.phase, WorkflowPhase::Failed);
}

#[tokio::test]
async fn test_pod_gc_on_workflow_completion() {
    let (cluster, ctrl, dir) = setup();
    let kubelet = Kubelet::new(cluster.clone(), dir.path());
    let spec = json!({
        "entrypoint": "main",
        "podGC": {"strategy": "OnWorkflowCompletion", "deleteDelayDuration": "30s"},
        "templates": [shell("main", "true")]
    });
    create(&cluster, &workflow("gc", spec)).await;

    let k = &kubelet;
    drive(&ctrl, &kubelet, "gc", move |pod: Pod| async move {
        k.finish(&pod.metadata.name, 0).await;
    })
    .await;

    let cleaner = ctrl.pod_cleaner();
    let delete = PodCleanupKey::new("argo", "gc", PodCleanupAction::DeletePod);
    let delay = cleaner.queue().pending_delay(&delete).unwrap();
    assert!(delay > Duration::from_secs(29) && delay <= Duration::from_secs(30), "{:?}", delay);

    let label = PodCleanupKey::new("argo", "gc", PodCleanupAction::LabelPodCompleted);
    cleaner.process(&label).await.unwrap();
    let pods = kubelet.pods().list(&Default::default()).await.unwrap();
    assert!(!pods.is_empty());
    for pod in pods {
        assert_eq!(pod.metadata.labels.get(LABEL_KEY_COMPLETED).map(String::as_str), Some("true"));
    }
}

#[test]
fn test_placeholder_forces_unresolved_expression() {
    let mut map = BTreeMap::new();
    map.insert("foo".to_string(), "__argo__internal__placeholder-1".to_string());
    let json = serde_json::to_string("{{=asInt(foo)}}").unwrap();
    assert_eq!(template::replace(&json, &map, false).unwrap(), json);
}
