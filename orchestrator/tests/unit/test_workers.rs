//! Background workers run against the in-memory cluster

use std::sync::Arc;
use std::time::Duration;

use argoflow::app::env::ControllerEnv;
use argoflow::clock;
use argoflow::cluster::{Api, InMemoryCluster, ListParams, SharedClient};
use argoflow::controller::pod_cleanup::{PodCleanupAction, PodCleanupKey};
use argoflow::controller::Controller;
use argoflow::storage::settings::Settings;
use argoflow::workers::{pod_cleanup, retention, ttl};
use chrono::Utc;
use workflow_api::workflow::TtlStrategy;
use workflow_api::{ObjectMeta, Pod, RetentionPolicy, Workflow, WorkflowPhase};

fn stop_after(ms: u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(tokio::time::sleep(Duration::from_millis(ms)))
}

fn finished(name: &str, phase: WorkflowPhase) -> Workflow {
    let mut wf = Workflow {
        metadata: ObjectMeta::named("argo", name),
        ..Default::default()
    };
    wf.status.phase = phase;
    wf.status.finished_at = Some(Utc::now() - chrono::Duration::hours(1));
    wf
}

async fn names(client: &SharedClient) -> Vec<String> {
    let api: Api<Workflow> = Api::namespaced(client.clone(), "argo");
    let mut names: Vec<String> = api
        .list(&ListParams::default())
        .await
        .unwrap()
        .into_iter()
        .map(|wf| wf.metadata.name)
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_retention_worker_caps_completed() {
    let client: SharedClient = Arc::new(InMemoryCluster::new());
    let api: Api<Workflow> = Api::namespaced(client.clone(), "argo");
    for name in ["a", "b", "c"] {
        api.create(&finished(name, WorkflowPhase::Succeeded)).await.unwrap();
    }
    api.create(&finished("broken", WorkflowPhase::Failed)).await.unwrap();

    let settings = Settings {
        retention_policy: Some(RetentionPolicy {
            completed: Some(1),
            ..Default::default()
        }),
        ..Default::default()
    };
    let ctrl = Controller::new(client.clone(), settings, ControllerEnv::default(), clock::system());
    let options = retention::Options {
        interval: Duration::from_millis(10),
    };
    retention::run(
        &options,
        ctrl,
        |d| tokio::time::sleep(d),
        stop_after(100),
    )
    .await;

    let left = names(&client).await;
    assert_eq!(left.len(), 2);
    assert!(left.contains(&"broken".to_string()));
}

#[tokio::test]
async fn test_ttl_worker_deletes_expired() {
    let client: SharedClient = Arc::new(InMemoryCluster::new());
    let api: Api<Workflow> = Api::namespaced(client.clone(), "argo");
    let mut expired = finished("expired", WorkflowPhase::Succeeded);
    expired.spec.ttl_strategy = Some(TtlStrategy {
        seconds_after_success: Some(10),
        ..Default::default()
    });
    let mut kept = finished("kept", WorkflowPhase::Succeeded);
    kept.spec.ttl_strategy = Some(TtlStrategy {
        seconds_after_success: Some(86400),
        ..Default::default()
    });
    api.create(&expired).await.unwrap();
    api.create(&kept).await.unwrap();

    let ctrl = Controller::new(client.clone(), Settings::default(), ControllerEnv::default(), clock::system());
    let collector = ctrl.ttl().clone();
    collector.enqueue(&expired);
    collector.enqueue(&kept);
    ttl::run(&ttl::Options::default(), collector, stop_after(100)).await;

    assert_eq!(names(&client).await, vec!["kept"]);
}

#[tokio::test]
async fn test_pod_cleanup_worker_deletes_pod() {
    let cluster = Arc::new(InMemoryCluster::new());
    let pods: Api<Pod> = Api::namespaced(cluster.clone(), "argo");
    pods.create(&Pod {
        metadata: ObjectMeta::named("argo", "done"),
        ..Default::default()
    })
    .await
    .unwrap();

    let ctrl = Controller::new(cluster.clone(), Settings::default(), ControllerEnv::default(), clock::system());
    let cleaner = ctrl.pod_cleaner().clone();
    let key = PodCleanupKey::new("argo", "done", PodCleanupAction::DeletePod);
    cleaner.queue().add(key.clone());
    // duplicate keys collapse
    cleaner.queue().add(key);
    pod_cleanup::run(&pod_cleanup::Options { workers: 2 }, cleaner, stop_after(100)).await;

    assert!(pods.get_opt("done").await.unwrap().is_none());
}
