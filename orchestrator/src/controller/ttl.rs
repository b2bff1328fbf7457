//! Deleting completed workflows once their TTL strategy expires

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use workflow_api::meta::split_key;
use workflow_api::{Workflow, WorkflowPhase};

use super::workqueue::WorkQueue;
use crate::clock::SharedClock;
use crate::cluster::{Api, DeleteOptions, SharedClient};
use crate::errors::WfError;

/// Seconds a completed workflow is kept, per its phase
pub fn ttl_seconds(wf: &Workflow) -> Option<i64> {
    let strategy = wf.spec.ttl_strategy.as_ref()?;
    match wf.status.phase {
        WorkflowPhase::Succeeded => strategy
            .seconds_after_success
            .or(strategy.seconds_after_completion),
        WorkflowPhase::Failed | WorkflowPhase::Error => strategy
            .seconds_after_failure
            .or(strategy.seconds_after_completion),
        _ => None,
    }
}

/// When the workflow becomes eligible for deletion
pub fn expires_at(wf: &Workflow) -> Option<DateTime<Utc>> {
    if !wf.completed() {
        return None;
    }
    let finished = wf.status.finished_at?;
    let ttl = ttl_seconds(wf)?;
    Some(finished + chrono::Duration::seconds(ttl.max(0) + 1))
}

/// Queues completed workflows and deletes them when their TTL is up
#[derive(Clone)]
pub struct TtlCollector {
    client: SharedClient,
    queue: WorkQueue<String>,
    clock: SharedClock,
}

impl TtlCollector {
    pub fn new(client: SharedClient, queue: WorkQueue<String>, clock: SharedClock) -> Self {
        Self { client, queue, clock }
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    /// Schedule `wf` for deletion if it has an expiring TTL
    pub fn enqueue(&self, wf: &Workflow) {
        let Some(at) = expires_at(wf) else {
            return;
        };
        let delay = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        debug!(workflow = %wf.metadata.key(), ?delay, "queueing workflow for TTL deletion");
        self.queue.add_after(wf.metadata.key(), delay);
    }

    /// Delete the workflow behind `key` if it is still completed and expired
    pub async fn process(&self, key: &str) -> Result<bool, WfError> {
        let (namespace, name) = split_key(key);
        let api: Api<Workflow> = Api::namespaced(self.client.clone(), namespace);
        let Some(wf) = api.get_opt(name).await? else {
            return Ok(false);
        };
        let Some(at) = expires_at(&wf) else {
            debug!(workflow = key, "workflow no longer eligible for TTL deletion");
            return Ok(false);
        };
        let now = self.clock.now();
        if at > now {
            self.queue
                .add_after(key.to_string(), (at - now).to_std().unwrap_or(Duration::ZERO));
            return Ok(false);
        }
        match api.delete(name, &DeleteOptions::background()).await {
            Ok(()) => {
                info!(workflow = key, "deleted workflow after TTL");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::cluster::InMemoryCluster;
    use std::sync::Arc;
    use workflow_api::workflow::TtlStrategy;
    use workflow_api::ObjectMeta;

    fn finished(phase: WorkflowPhase, at: DateTime<Utc>) -> Workflow {
        let mut wf = Workflow {
            metadata: ObjectMeta::named("argo", "done"),
            ..Default::default()
        };
        wf.spec.ttl_strategy = Some(TtlStrategy {
            seconds_after_completion: Some(60),
            seconds_after_success: Some(10),
            seconds_after_failure: None,
        });
        wf.status.phase = phase;
        wf.status.finished_at = Some(at);
        wf
    }

    #[test]
    fn test_ttl_by_phase() {
        let now = Utc::now();
        assert_eq!(ttl_seconds(&finished(WorkflowPhase::Succeeded, now)), Some(10));
        assert_eq!(ttl_seconds(&finished(WorkflowPhase::Failed, now)), Some(60));
        assert_eq!(
            expires_at(&finished(WorkflowPhase::Succeeded, now)),
            Some(now + chrono::Duration::seconds(11))
        );
        assert_eq!(expires_at(&finished(WorkflowPhase::Running, now)), None);
    }

    #[tokio::test]
    async fn test_deletes_only_when_expired() {
        let clock = ManualClock::new(Utc::now());
        let cluster: SharedClient = Arc::new(InMemoryCluster::new());
        let api: Api<Workflow> = Api::namespaced(cluster.clone(), "argo");
        api.create(&finished(WorkflowPhase::Succeeded, clock.now())).await.unwrap();

        let collector = TtlCollector::new(cluster, WorkQueue::new(), Arc::new(clock.clone()));
        assert!(!collector.process("argo/done").await.unwrap());
        assert!(collector.queue().pending_delay(&"argo/done".to_string()).is_some());

        clock.advance(chrono::Duration::seconds(12));
        assert!(collector.process("argo/done").await.unwrap());
        assert!(api.get_opt("done").await.unwrap().is_none());
        assert!(!collector.process("argo/done").await.unwrap());
    }
}
