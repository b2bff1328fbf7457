//! Archive of completed workflows

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use workflow_api::Workflow;

use super::object_store::ObjectStore;
use crate::errors::WfError;

/// Summary stored next to each archived workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedWorkflow {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl From<&Workflow> for ArchivedWorkflow {
    fn from(wf: &Workflow) -> Self {
        Self {
            name: wf.name().to_string(),
            namespace: wf.namespace().to_string(),
            uid: wf.uid().to_string(),
            phase: wf.status.phase.as_str().to_string(),
            started_at: wf.status.started_at,
            finished_at: wf.status.finished_at,
            labels: wf.metadata.labels.clone(),
        }
    }
}

#[async_trait]
pub trait ArchiveRepo: Send + Sync {
    async fn archive(&self, wf: &Workflow) -> Result<(), WfError>;

    async fn get(&self, uid: &str) -> Result<Workflow, WfError>;

    async fn list(&self) -> Result<Vec<ArchivedWorkflow>, WfError>;

    async fn delete(&self, uid: &str) -> Result<(), WfError>;

    /// Delete entries that finished before `older_than`; returns how many
    async fn delete_expired(&self, older_than: DateTime<Utc>) -> Result<usize, WfError> {
        let mut deleted = 0;
        for entry in self.list().await? {
            if entry.finished_at.map(|f| f < older_than).unwrap_or(false) {
                self.delete(&entry.uid).await?;
                info!(workflow = %entry.name, uid = %entry.uid, "deleted expired archived workflow");
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Archive over an object store; keys are `<cluster>/<uid>-workflow.json`
pub struct ObjectStoreArchive {
    store: ObjectStore,
    cluster: String,
}

impl ObjectStoreArchive {
    pub fn new(store: ObjectStore, cluster: &str) -> Self {
        Self {
            store,
            cluster: cluster.to_string(),
        }
    }

    fn key(&self, uid: &str) -> String {
        format!("{}/{}-workflow.json", self.cluster, uid)
    }

    fn meta_key(&self, uid: &str) -> String {
        format!("{}.meta.json", self.key(uid))
    }
}

#[async_trait]
impl ArchiveRepo for ObjectStoreArchive {
    async fn archive(&self, wf: &Workflow) -> Result<(), WfError> {
        if wf.uid().is_empty() {
            return Err(WfError::BadRequest(format!("workflow {} has no uid", wf.name())));
        }
        self.store.put_json(&self.key(wf.uid()), wf).await?;
        self.store
            .put_json(&self.meta_key(wf.uid()), &ArchivedWorkflow::from(wf))
            .await
    }

    async fn get(&self, uid: &str) -> Result<Workflow, WfError> {
        self.store.get_json(&self.key(uid)).await
    }

    async fn list(&self) -> Result<Vec<ArchivedWorkflow>, WfError> {
        let mut entries = Vec::new();
        for key in self.store.list(&self.cluster).await? {
            if key.ends_with(".meta.json") {
                entries.push(self.store.get_json(&key).await?);
            }
        }
        Ok(entries)
    }

    async fn delete(&self, uid: &str) -> Result<(), WfError> {
        self.store.delete(&self.key(uid)).await?;
        self.store.delete(&self.meta_key(uid)).await
    }
}
