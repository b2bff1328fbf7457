//! Offloaded node status
//!
//! Node maps larger than the configured size are moved out of the workflow
//! object. Each save produces a new version (`fnv:<hash>`); the workflow
//! carries only that version. Old versions are reaped by the offload GC
//! worker once they are older than the TTL and no live workflow uses them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use workflow_api::Nodes;

use super::object_store::ObjectStore;
use crate::clock::SharedClock;
use crate::errors::WfError;
use crate::utils::fnv32a;

/// One stored version of a workflow's node map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OffloadRecord {
    pub namespace: String,
    pub uid: String,
    pub version: String,
    pub created: DateTime<Utc>,
}

#[async_trait]
pub trait OffloadRepo: Send + Sync {
    /// Store `nodes`; returns the version to record on the workflow
    async fn save(&self, uid: &str, namespace: &str, nodes: &Nodes) -> Result<String, WfError>;

    async fn get(&self, uid: &str, version: &str) -> Result<Nodes, WfError>;

    /// Versions created before `older_than`
    async fn list_old_offloads(&self, older_than: DateTime<Utc>) -> Result<Vec<OffloadRecord>, WfError>;

    async fn delete(&self, uid: &str, version: &str) -> Result<(), WfError>;
}

/// Version label of a serialized node map
pub fn node_status_version(serialized: &[u8]) -> String {
    format!("fnv:{}", fnv32a(serialized))
}

/// Offload repository over an object store
///
/// Keys are `<cluster>/<uid>-<version>-node-status.json`, with the record in a
/// `.meta.json` document next to it.
pub struct ObjectStoreOffload {
    store: ObjectStore,
    cluster: String,
    clock: SharedClock,
}

impl ObjectStoreOffload {
    pub fn new(store: ObjectStore, cluster: &str, clock: SharedClock) -> Self {
        Self {
            store,
            cluster: cluster.to_string(),
            clock,
        }
    }

    fn key(&self, uid: &str, version: &str) -> String {
        format!("{}/{}-{}-node-status.json", self.cluster, uid, version.replace(':', "-"))
    }

    fn meta_key(&self, uid: &str, version: &str) -> String {
        format!("{}.meta.json", self.key(uid, version))
    }
}

#[async_trait]
impl OffloadRepo for ObjectStoreOffload {
    async fn save(&self, uid: &str, namespace: &str, nodes: &Nodes) -> Result<String, WfError> {
        let data = serde_json::to_vec(nodes)?;
        let version = node_status_version(&data);
        let record = OffloadRecord {
            namespace: namespace.to_string(),
            uid: uid.to_string(),
            version: version.clone(),
            created: self.clock.now(),
        };
        self.store.put(&self.key(uid, &version), data).await?;
        self.store.put_json(&self.meta_key(uid, &version), &record).await?;
        debug!(uid, version = %version, "offloaded node status");
        Ok(version)
    }

    async fn get(&self, uid: &str, version: &str) -> Result<Nodes, WfError> {
        self.store.get_json(&self.key(uid, version)).await
    }

    async fn list_old_offloads(&self, older_than: DateTime<Utc>) -> Result<Vec<OffloadRecord>, WfError> {
        let mut records = Vec::new();
        for key in self.store.list(&self.cluster).await? {
            if !key.ends_with(".meta.json") {
                continue;
            }
            let record: OffloadRecord = self.store.get_json(&key).await?;
            if record.created < older_than {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn delete(&self, uid: &str, version: &str) -> Result<(), WfError> {
        self.store.delete(&self.key(uid, version)).await?;
        self.store.delete(&self.meta_key(uid, version)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;
    use workflow_api::{NodePhase, NodeStatus, NodeType};

    fn nodes(phase: NodePhase) -> Nodes {
        let mut nodes = Nodes::new();
        nodes.insert(NodeStatus {
            id: "wf".to_string(),
            name: "wf".to_string(),
            node_type: NodeType::Steps,
            phase,
            ..Default::default()
        });
        nodes
    }

    #[tokio::test]
    async fn test_save_get_and_list_old() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let repo = ObjectStoreOffload::new(
            ObjectStore::on_volume(tmp.path(), "offload"),
            "c1",
            Arc::new(clock.clone()),
        );

        let v1 = repo.save("uid-1", "argo", &nodes(NodePhase::Running)).await.unwrap();
        assert!(v1.starts_with("fnv:"));
        clock.advance(chrono::Duration::minutes(10));
        let v2 = repo.save("uid-1", "argo", &nodes(NodePhase::Succeeded)).await.unwrap();
        assert_ne!(v1, v2);

        let loaded = repo.get("uid-1", &v2).await.unwrap();
        assert_eq!(loaded.get("wf").unwrap().phase, NodePhase::Succeeded);

        let old = repo.list_old_offloads(clock.now() - chrono::Duration::minutes(5)).await.unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].version, v1);
        assert_eq!(old[0].namespace, "argo");

        repo.delete("uid-1", &v1).await.unwrap();
        assert!(repo.get("uid-1", &v1).await.unwrap_err().is_not_found());
        assert!(repo
            .list_old_offloads(clock.now())
            .await
            .unwrap()
            .iter()
            .all(|r| r.version == v2));
    }
}
