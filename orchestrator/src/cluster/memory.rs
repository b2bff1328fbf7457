//! In-process cluster used by tests and local runs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use tracing::debug;

use super::{merge_patch, set_path, ClusterClient, DeleteOptions, ListParams, ResourceType};
use crate::clock::{self, SharedClock};
use crate::errors::WfError;

/// (kind, namespace, name)
type ObjectKey = (String, String, String);

/// A command run through [`ClusterClient::exec_in_container`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub argv: Vec<String>,
}

/// Object store with resource versions, finalizers and owner cascading
pub struct InMemoryCluster {
    objects: RwLock<BTreeMap<ObjectKey, Value>>,
    resource_version: AtomicU64,
    exec_log: Mutex<Vec<ExecRecord>>,
    clock: SharedClock,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            resource_version: AtomicU64::new(0),
            exec_log: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Every command executed so far
    pub fn exec_log(&self) -> Vec<ExecRecord> {
        self.exec_log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of stored objects of a kind
    pub fn count(&self, kind: &str) -> usize {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        objects.keys().filter(|(k, _, _)| k == kind).count()
    }

    fn next_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn key(rt: &ResourceType, namespace: &str, name: &str) -> ObjectKey {
        let namespace = if rt.namespaced { namespace } else { "" };
        (rt.kind.clone(), namespace.to_string(), name.to_string())
    }

    /// Remove an object and, in the background style, everything it owns
    fn remove_cascading(objects: &mut BTreeMap<ObjectKey, Value>, key: &ObjectKey, now: &str, next_rv: &dyn Fn() -> String) {
        let Some(removed) = objects.remove(key) else {
            return;
        };
        let uid = meta_str(&removed, "uid");
        if uid.is_empty() {
            return;
        }
        let owned: Vec<ObjectKey> = objects
            .iter()
            .filter(|(_, v)| {
                v.pointer("/metadata/ownerReferences")
                    .and_then(Value::as_array)
                    .map(|refs| refs.iter().any(|r| r.get("uid").and_then(Value::as_str) == Some(uid.as_str())))
                    .unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for child in owned {
            let has_finalizers = objects
                .get(&child)
                .and_then(|v| v.pointer("/metadata/finalizers"))
                .and_then(Value::as_array)
                .map(|f| !f.is_empty())
                .unwrap_or(false);
            if has_finalizers {
                if let Some(object) = objects.get_mut(&child) {
                    set_path(object, &["metadata", "deletionTimestamp"], json!(now));
                    set_path(object, &["metadata", "resourceVersion"], json!(next_rv()));
                }
            } else {
                Self::remove_cascading(objects, &child, now, next_rv);
            }
        }
    }

    /// Finish a pending deletion once the last finalizer is gone
    fn reap_if_finalized(&self, objects: &mut BTreeMap<ObjectKey, Value>, key: &ObjectKey) {
        let ready = objects
            .get(key)
            .map(|v| {
                v.pointer("/metadata/deletionTimestamp").is_some()
                    && v.pointer("/metadata/finalizers")
                        .and_then(Value::as_array)
                        .map(|f| f.is_empty())
                        .unwrap_or(true)
            })
            .unwrap_or(false);
        if ready {
            let now = self.clock.now().to_rfc3339();
            Self::remove_cascading(objects, key, &now, &|| self.next_version());
        }
    }
}

fn meta_str(object: &Value, field: &str) -> String {
    object
        .pointer(&format!("/metadata/{}", field))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn not_found(rt: &ResourceType, namespace: &str, name: &str) -> WfError {
    WfError::NotFound(format!("{} {}/{} not found", rt.kind, namespace, name))
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get(&self, rt: &ResourceType, namespace: &str, name: &str) -> Result<Value, WfError> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        objects
            .get(&Self::key(rt, namespace, name))
            .cloned()
            .ok_or_else(|| not_found(rt, namespace, name))
    }

    async fn list(&self, rt: &ResourceType, namespace: &str, params: &ListParams) -> Result<Vec<Value>, WfError> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .iter()
            .filter(|((kind, ns, _), _)| kind == &rt.kind && (namespace.is_empty() || !rt.namespaced || ns == namespace))
            .filter(|(_, v)| params.matches(v))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn create(&self, rt: &ResourceType, namespace: &str, object: &Value) -> Result<Value, WfError> {
        let mut object = object.clone();
        let mut name = meta_str(&object, "name");
        if name.is_empty() {
            let generate_name = meta_str(&object, "generateName");
            if generate_name.is_empty() {
                return Err(WfError::BadRequest(format!(
                    "{}: name or generateName is required",
                    rt.kind
                )));
            }
            name = format!("{}{}", generate_name, random_suffix());
        }
        let namespace = if rt.namespaced { namespace.to_string() } else { String::new() };
        let key = Self::key(rt, &namespace, &name);

        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        if objects.contains_key(&key) {
            return Err(WfError::Conflict(format!(
                "{} {}/{} already exists",
                rt.kind, namespace, name
            )));
        }
        set_path(&mut object, &["apiVersion"], json!(rt.api_version()));
        set_path(&mut object, &["kind"], json!(rt.kind));
        set_path(&mut object, &["metadata", "name"], json!(name));
        if rt.namespaced {
            set_path(&mut object, &["metadata", "namespace"], json!(namespace));
        }
        set_path(&mut object, &["metadata", "uid"], json!(uuid::Uuid::new_v4().to_string()));
        set_path(&mut object, &["metadata", "creationTimestamp"], json!(self.clock.now().to_rfc3339()));
        set_path(&mut object, &["metadata", "resourceVersion"], json!(self.next_version()));
        if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("deletionTimestamp");
        }
        debug!("created {} {}/{}", rt.kind, namespace, name);
        objects.insert(key, object.clone());
        Ok(object)
    }

    async fn update(&self, rt: &ResourceType, namespace: &str, object: &Value) -> Result<Value, WfError> {
        let name = meta_str(object, "name");
        let key = Self::key(rt, namespace, &name);
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let stored = objects.get(&key).ok_or_else(|| not_found(rt, namespace, &name))?;

        let incoming_rv = meta_str(object, "resourceVersion");
        if !incoming_rv.is_empty() && incoming_rv != meta_str(stored, "resourceVersion") {
            return Err(WfError::Conflict(format!(
                "Operation cannot be fulfilled on {} \"{}\": the object has been modified; please apply your changes to the latest version and try again",
                rt.plural, name
            )));
        }

        let mut updated = object.clone();
        for field in ["uid", "creationTimestamp", "deletionTimestamp", "namespace"] {
            match stored.pointer(&format!("/metadata/{}", field)) {
                Some(value) => set_path(&mut updated, &["metadata", field], value.clone()),
                None => {
                    if let Some(meta) = updated.get_mut("metadata").and_then(Value::as_object_mut) {
                        meta.remove(field);
                    }
                }
            }
        }
        set_path(&mut updated, &["apiVersion"], json!(rt.api_version()));
        set_path(&mut updated, &["kind"], json!(rt.kind));
        set_path(&mut updated, &["metadata", "resourceVersion"], json!(self.next_version()));
        objects.insert(key.clone(), updated.clone());
        self.reap_if_finalized(&mut objects, &key);
        Ok(updated)
    }

    async fn patch(&self, rt: &ResourceType, namespace: &str, name: &str, patch: &Value) -> Result<Value, WfError> {
        let key = Self::key(rt, namespace, name);
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let stored = objects.get(&key).ok_or_else(|| not_found(rt, namespace, name))?;

        let patch_rv = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or("");
        if !patch_rv.is_empty() && patch_rv != meta_str(stored, "resourceVersion") {
            return Err(WfError::Conflict(format!(
                "Operation cannot be fulfilled on {} \"{}\": the object has been modified",
                rt.plural, name
            )));
        }

        let mut patched = stored.clone();
        merge_patch(&mut patched, patch);
        for field in ["uid", "creationTimestamp", "name", "namespace"] {
            if let Some(value) = stored.pointer(&format!("/metadata/{}", field)) {
                set_path(&mut patched, &["metadata", field], value.clone());
            }
        }
        set_path(&mut patched, &["metadata", "resourceVersion"], json!(self.next_version()));
        objects.insert(key.clone(), patched.clone());
        self.reap_if_finalized(&mut objects, &key);
        Ok(patched)
    }

    async fn delete(
        &self,
        rt: &ResourceType,
        namespace: &str,
        name: &str,
        _options: &DeleteOptions,
    ) -> Result<(), WfError> {
        let key = Self::key(rt, namespace, name);
        let now = self.clock.now().to_rfc3339();
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let stored = objects.get_mut(&key).ok_or_else(|| not_found(rt, namespace, name))?;

        let has_finalizers = stored
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if has_finalizers {
            if stored.pointer("/metadata/deletionTimestamp").is_none() {
                set_path(stored, &["metadata", "deletionTimestamp"], json!(now));
                set_path(stored, &["metadata", "resourceVersion"], json!(self.next_version()));
            }
            debug!("{} {}/{} marked for deletion", rt.kind, namespace, name);
            return Ok(());
        }
        Self::remove_cascading(&mut objects, &key, &now, &|| self.next_version());
        debug!("deleted {} {}/{}", rt.kind, namespace, name);
        Ok(())
    }

    async fn exec_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> Result<String, WfError> {
        self.get(&ResourceType::for_kind("Pod"), namespace, pod).await?;
        self.exec_log.lock().unwrap_or_else(|e| e.into_inner()).push(ExecRecord {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
            argv: argv.to_vec(),
        });
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pods() -> ResourceType {
        ResourceType::for_kind("Pod")
    }

    #[tokio::test]
    async fn test_create_get_and_conflict() {
        let cluster = InMemoryCluster::new();
        let pod = json!({"metadata": {"name": "p"}});
        let created = cluster.create(&pods(), "argo", &pod).await.unwrap();
        assert_eq!(created["metadata"]["namespace"], "argo");
        assert_eq!(created["kind"], "Pod");
        assert!(!meta_str(&created, "uid").is_empty());

        let err = cluster.create(&pods(), "argo", &pod).await.unwrap_err();
        assert!(err.is_conflict());

        let got = cluster.get(&pods(), "argo", "p").await.unwrap();
        assert_eq!(got, created);
        assert!(cluster.get(&pods(), "other", "p").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_generate_name() {
        let cluster = InMemoryCluster::new();
        let created = cluster
            .create(&pods(), "argo", &json!({"metadata": {"generateName": "wf-"}}))
            .await
            .unwrap();
        let name = meta_str(&created, "name");
        assert!(name.starts_with("wf-"));
        assert_eq!(name.len(), 8);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let cluster = InMemoryCluster::new();
        let created = cluster.create(&pods(), "argo", &json!({"metadata": {"name": "p"}})).await.unwrap();

        let mut first = created.clone();
        first["spec"] = json!({"nodeName": "a"});
        cluster.update(&pods(), "argo", &first).await.unwrap();

        let mut stale = created;
        stale["spec"] = json!({"nodeName": "b"});
        assert!(cluster.update(&pods(), "argo", &stale).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_finalizer_blocks_delete_until_removed() {
        let cluster = InMemoryCluster::new();
        cluster
            .create(&pods(), "argo", &json!({"metadata": {"name": "p", "finalizers": ["x"]}}))
            .await
            .unwrap();
        cluster.delete(&pods(), "argo", "p", &DeleteOptions::default()).await.unwrap();
        let pod = cluster.get(&pods(), "argo", "p").await.unwrap();
        assert!(pod.pointer("/metadata/deletionTimestamp").is_some());

        cluster
            .patch(&pods(), "argo", "p", &json!({"metadata": {"finalizers": null}}))
            .await
            .unwrap();
        assert!(cluster.get(&pods(), "argo", "p").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_owner_cascade() {
        let cluster = InMemoryCluster::new();
        let workflows = ResourceType::for_kind("Workflow");
        let wf = cluster.create(&workflows, "argo", &json!({"metadata": {"name": "wf"}})).await.unwrap();
        let uid = meta_str(&wf, "uid");
        let results = ResourceType::for_kind("WorkflowTaskResult");
        cluster
            .create(
                &results,
                "argo",
                &json!({"metadata": {"name": "wf-1", "ownerReferences": [{"apiVersion": "argoproj.io/v1alpha1", "kind": "Workflow", "name": "wf", "uid": uid}]}}),
            )
            .await
            .unwrap();
        assert_eq!(cluster.count("WorkflowTaskResult"), 1);
        cluster.delete(&workflows, "argo", "wf", &DeleteOptions::background()).await.unwrap();
        assert_eq!(cluster.count("WorkflowTaskResult"), 0);
    }

    #[tokio::test]
    async fn test_secret_and_manifest() {
        let cluster = InMemoryCluster::new();
        cluster
            .create(
                &ResourceType::secret(),
                "argo",
                &json!({"metadata": {"name": "creds"}, "data": {"token": "c2VjcmV0"}}),
            )
            .await
            .unwrap();
        assert_eq!(cluster.get_secret("argo", "creds", "token").await.unwrap(), "secret");
        assert!(cluster.get_secret("argo", "creds", "missing").await.unwrap_err().is_not_found());

        let manifest = "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: job\nspec:\n  parallelism: 1\n";
        cluster.apply_manifest("argo", "create", manifest, "").await.unwrap();
        let patched = cluster
            .apply_manifest("argo", "apply", "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: job\nspec:\n  parallelism: 2\n", "")
            .await
            .unwrap();
        assert_eq!(patched["spec"]["parallelism"], 2);
        cluster.apply_manifest("argo", "delete", manifest, "").await.unwrap();
        assert_eq!(cluster.count("Job"), 0);
    }

    #[tokio::test]
    async fn test_exec_records_command() {
        let cluster = InMemoryCluster::new();
        cluster.create(&pods(), "argo", &json!({"metadata": {"name": "p"}})).await.unwrap();
        let argv = vec!["kill".to_string(), "-s".to_string(), "TERM".to_string(), "1".to_string()];
        cluster.exec_in_container("argo", "p", "main", &argv).await.unwrap();
        assert_eq!(cluster.exec_log()[0].argv, argv);
    }
}
