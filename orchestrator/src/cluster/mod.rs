//! Cluster API access
//!
//! Objects cross the [`ClusterClient`] boundary as JSON values; [`Api`] is the
//! typed view used by the controllers and the executor.

pub mod informer;
pub mod memory;
pub mod rest;

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use workflow_api::meta::Resource;

use crate::errors::WfError;

pub use informer::{Informer, Store, WatchEvent};
pub use memory::InMemoryCluster;
pub use rest::KubeRestClient;

// ====== RESOURCE TYPES ====== //

/// API coordinates of a resource kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceType {
    /// Empty for the core group
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "ClusterWorkflowTemplate",
    "Namespace",
    "Node",
    "PersistentVolume",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
];

const WORKFLOW_KINDS: &[&str] = &[
    "Workflow",
    "WorkflowTemplate",
    "ClusterWorkflowTemplate",
    "WorkflowTaskResult",
    "WorkflowTaskSet",
];

const CORE_KINDS: &[&str] = &[
    "Pod",
    "Secret",
    "ConfigMap",
    "ServiceAccount",
    "Service",
    "PersistentVolumeClaim",
    "Namespace",
    "Node",
    "PersistentVolume",
    "Event",
];

impl ResourceType {
    /// Coordinates from an `apiVersion` and a kind
    pub fn new(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self {
            group,
            version,
            kind: kind.to_string(),
            plural: pluralize(kind),
            namespaced: !CLUSTER_SCOPED_KINDS.contains(&kind),
        }
    }

    /// Coordinates of a well-known kind; unknown kinds are assumed to be workflow resources
    pub fn for_kind(kind: &str) -> Self {
        if CORE_KINDS.contains(&kind) {
            Self::new("v1", kind)
        } else {
            Self::new(&workflow_api::api_version(), kind)
        }
    }

    /// Coordinates from a kind as typed on a command line (`pod`, `configmap`, `Workflow`)
    pub fn for_kind_name(name: &str) -> Self {
        let known = CORE_KINDS
            .iter()
            .chain(CLUSTER_SCOPED_KINDS)
            .chain(WORKFLOW_KINDS)
            .find(|k| k.eq_ignore_ascii_case(name));
        match known {
            Some(kind) => Self::for_kind(kind),
            None => {
                let mut chars = name.chars();
                let kind: String = match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                };
                Self::for_kind(&kind)
            }
        }
    }

    pub fn of<T: Resource>() -> Self {
        Self::for_kind(T::KIND)
    }

    pub fn cluster_workflow_template() -> Self {
        Self::for_kind("ClusterWorkflowTemplate")
    }

    pub fn secret() -> Self {
        Self::for_kind("Secret")
    }

    pub fn config_map() -> Self {
        Self::for_kind("ConfigMap")
    }

    /// Coordinates from the `apiVersion` and `kind` of an object
    pub fn from_object(object: &Value) -> Result<Self, WfError> {
        let api_version = object.get("apiVersion").and_then(Value::as_str).unwrap_or("");
        let kind = object.get("kind").and_then(Value::as_str).unwrap_or("");
        if api_version.is_empty() || kind.is_empty() {
            return Err(WfError::BadRequest(
                "manifest must have apiVersion and kind".to_string(),
            ));
        }
        Ok(Self::new(api_version, kind))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// REST path of the collection, or of one object when `name` is given
    pub fn path(&self, namespace: &str, name: Option<&str>) -> String {
        let mut path = if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };
        if self.namespaced && !namespace.is_empty() {
            path.push_str(&format!("/namespaces/{}", namespace));
        }
        path.push('/');
        path.push_str(&self.plural);
        if let Some(name) = name {
            path.push('/');
            path.push_str(name);
        }
        path
    }
}

fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with('x') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        if stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            format!("{}s", lower)
        } else {
            format!("{}ies", stem)
        }
    } else {
        format!("{}s", lower)
    }
}

// ====== REQUEST OPTIONS ====== //

/// Equality label selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    pub labels: BTreeMap<String, String>,
}

impl ListParams {
    pub fn labels(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, object: &Value) -> bool {
        let labels = object.pointer("/metadata/labels");
        self.labels.iter().all(|(k, v)| {
            labels
                .and_then(|l| l.get(k))
                .and_then(Value::as_str)
                .map(|l| l == v)
                .unwrap_or(false)
        })
    }

    /// `k1=v1,k2=v2`
    pub fn selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub grace_period_seconds: Option<i64>,
    /// `Background`, `Foreground` or `Orphan`
    pub propagation_policy: Option<String>,
}

impl DeleteOptions {
    pub fn background() -> Self {
        Self {
            propagation_policy: Some("Background".to_string()),
            ..Default::default()
        }
    }

    pub fn with_grace_period(seconds: i64) -> Self {
        Self {
            grace_period_seconds: Some(seconds),
            ..Default::default()
        }
    }
}

// ====== CLIENT ====== //

/// Untyped access to the cluster API
///
/// Updates carry `metadata.resourceVersion` and fail with
/// [`WfError::Conflict`] when it is stale. Patches are JSON merge patches.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, rt: &ResourceType, namespace: &str, name: &str) -> Result<Value, WfError>;

    async fn list(
        &self,
        rt: &ResourceType,
        namespace: &str,
        params: &ListParams,
    ) -> Result<Vec<Value>, WfError>;

    async fn create(&self, rt: &ResourceType, namespace: &str, object: &Value) -> Result<Value, WfError>;

    async fn update(&self, rt: &ResourceType, namespace: &str, object: &Value) -> Result<Value, WfError>;

    async fn patch(
        &self,
        rt: &ResourceType,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Value, WfError>;

    async fn delete(
        &self,
        rt: &ResourceType,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), WfError>;

    /// Run `argv` in a container and return its standard output
    async fn exec_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> Result<String, WfError>;

    /// Decoded value of one key of a secret
    async fn get_secret(&self, namespace: &str, name: &str, key: &str) -> Result<String, WfError> {
        let secret = self.get(&ResourceType::secret(), namespace, name).await?;
        secret_value(&secret, key)
    }

    async fn get_config_map_key(&self, namespace: &str, name: &str, key: &str) -> Result<String, WfError> {
        let config_map = self.get(&ResourceType::config_map(), namespace, name).await?;
        config_map_value(&config_map, key)
    }

    /// Perform a resource-template action with a single-document manifest
    async fn apply_manifest(
        &self,
        namespace: &str,
        action: &str,
        manifest: &str,
        merge_strategy: &str,
    ) -> Result<Value, WfError> {
        let mut object: Value = workflow_api::yaml::parse_one(manifest)?;
        let rt = ResourceType::from_object(&object)?;
        let namespace = match object.pointer("/metadata/namespace").and_then(Value::as_str) {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => namespace.to_string(),
        };
        if rt.namespaced {
            set_path(&mut object, &["metadata", "namespace"], Value::String(namespace.clone()));
        }
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        match action {
            "create" => self.create(&rt, &namespace, &object).await,
            "get" => self.get(&rt, &namespace, &name).await,
            "apply" => match self.get(&rt, &namespace, &name).await {
                Ok(_) => self.patch(&rt, &namespace, &name, &object).await,
                Err(e) if e.is_not_found() => self.create(&rt, &namespace, &object).await,
                Err(e) => Err(e),
            },
            "replace" => {
                let existing = self.get(&rt, &namespace, &name).await?;
                if let Some(rv) = existing.pointer("/metadata/resourceVersion") {
                    set_path(&mut object, &["metadata", "resourceVersion"], rv.clone());
                }
                self.update(&rt, &namespace, &object).await
            }
            "patch" => match merge_strategy {
                "" | "strategic" | "merge" => self.patch(&rt, &namespace, &name, &object).await,
                other => Err(WfError::BadRequest(format!("unsupported merge strategy: {}", other))),
            },
            "delete" => {
                match self.delete(&rt, &namespace, &name, &DeleteOptions::background()).await {
                    Ok(()) => Ok(object),
                    Err(e) if e.is_not_found() => Ok(object),
                    Err(e) => Err(e),
                }
            }
            other => Err(WfError::BadRequest(format!("unsupported resource action: {}", other))),
        }
    }

    /// Current JSON of a resource, used for success and failure conditions
    async fn get_resource_json(&self, rt: &ResourceType, namespace: &str, name: &str) -> Result<Value, WfError> {
        self.get(rt, namespace, name).await
    }
}

pub type SharedClient = Arc<dyn ClusterClient>;

// ====== TYPED API ====== //

/// Typed view of one resource kind in one namespace (or all, when empty)
pub struct Api<T> {
    client: SharedClient,
    rt: ResourceType,
    namespace: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Api<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            rt: self.rt.clone(),
            namespace: self.namespace.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Api<T>
where
    T: Resource + Serialize + DeserializeOwned,
{
    pub fn namespaced(client: SharedClient, namespace: &str) -> Self {
        Self::with_type(client, ResourceType::of::<T>(), namespace)
    }

    /// Every namespace; list only
    pub fn all(client: SharedClient) -> Self {
        Self::namespaced(client, "")
    }

    pub fn with_type(client: SharedClient, rt: ResourceType, namespace: &str) -> Self {
        Self {
            client,
            rt,
            namespace: namespace.to_string(),
            _marker: PhantomData,
        }
    }

    pub fn resource_type(&self) -> &ResourceType {
        &self.rt
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn client(&self) -> &SharedClient {
        &self.client
    }

    pub async fn get(&self, name: &str) -> Result<T, WfError> {
        from_value(self.client.get(&self.rt, &self.namespace, name).await?)
    }

    /// `None` when the object does not exist
    pub async fn get_opt(&self, name: &str) -> Result<Option<T>, WfError> {
        match self.get(name).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self, params: &ListParams) -> Result<Vec<T>, WfError> {
        self.client
            .list(&self.rt, &self.namespace, params)
            .await?
            .into_iter()
            .map(from_value)
            .collect()
    }

    pub async fn create(&self, object: &T) -> Result<T, WfError> {
        let namespace = self.namespace_of(object);
        from_value(self.client.create(&self.rt, &namespace, &serde_json::to_value(object)?).await?)
    }

    pub async fn update(&self, object: &T) -> Result<T, WfError> {
        let namespace = self.namespace_of(object);
        from_value(self.client.update(&self.rt, &namespace, &serde_json::to_value(object)?).await?)
    }

    pub async fn patch(&self, name: &str, patch: &Value) -> Result<T, WfError> {
        from_value(self.client.patch(&self.rt, &self.namespace, name, patch).await?)
    }

    /// Set labels; a `None` value removes the label
    pub async fn patch_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<T, WfError> {
        let labels: Map<String, Value> = labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().map(Value::String).unwrap_or(Value::Null)))
            .collect();
        self.patch(name, &json!({ "metadata": { "labels": labels } })).await
    }

    pub async fn delete(&self, name: &str, options: &DeleteOptions) -> Result<(), WfError> {
        self.client.delete(&self.rt, &self.namespace, name, options).await
    }

    fn namespace_of(&self, object: &T) -> String {
        let ns = &object.meta().namespace;
        if ns.is_empty() {
            self.namespace.clone()
        } else {
            ns.clone()
        }
    }
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, WfError> {
    Ok(serde_json::from_value(value)?)
}

// ====== JSON HELPERS ====== //

fn object_name(object: &Value) -> String {
    let namespace = object.pointer("/metadata/namespace").and_then(Value::as_str).unwrap_or("");
    let name = object.pointer("/metadata/name").and_then(Value::as_str).unwrap_or("");
    format!("{}/{}", namespace, name)
}

/// Decoded value of `key` in a secret object
pub fn secret_value(secret: &Value, key: &str) -> Result<String, WfError> {
    if let Some(value) = secret.pointer(&format!("/stringData/{}", escape_pointer(key))) {
        return Ok(value.as_str().unwrap_or_default().to_string());
    }
    let encoded = secret
        .pointer(&format!("/data/{}", escape_pointer(key)))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            WfError::NotFound(format!("secret {} does not have the key {}", object_name(secret), key))
        })?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| WfError::Internal(format!("secret {} key {}: {}", object_name(secret), key, e)))?;
    String::from_utf8(bytes)
        .map_err(|e| WfError::Internal(format!("secret {} key {}: {}", object_name(secret), key, e)))
}

/// Value of `key` in a config map object
pub fn config_map_value(config_map: &Value, key: &str) -> Result<String, WfError> {
    config_map
        .pointer(&format!("/data/{}", escape_pointer(key)))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            WfError::NotFound(format!(
                "config map {} does not have the key {}",
                object_name(config_map),
                key
            ))
        })
}

/// Apply an RFC 7386 JSON merge patch; `null` removes a key
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Set a nested object field, creating intermediate objects
pub fn set_path(target: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *target = value;
        return;
    };
    let mut current = target;
    for key in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map.entry(key.to_string()).or_insert(Value::Object(Map::new())),
            _ => return,
        };
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_paths() {
        let pods = ResourceType::for_kind("Pod");
        assert_eq!(pods.path("argo", Some("wf-1")), "/api/v1/namespaces/argo/pods/wf-1");

        let workflows = ResourceType::for_kind("Workflow");
        assert_eq!(
            workflows.path("argo", None),
            "/apis/argoproj.io/v1alpha1/namespaces/argo/workflows"
        );
        assert_eq!(workflows.path("", None), "/apis/argoproj.io/v1alpha1/workflows");

        let cwft = ResourceType::cluster_workflow_template();
        assert!(!cwft.namespaced);
        assert_eq!(
            cwft.path("argo", Some("x")),
            "/apis/argoproj.io/v1alpha1/clusterworkflowtemplates/x"
        );

        let jobs = ResourceType::new("batch/v1", "Job");
        assert_eq!(jobs.api_version(), "batch/v1");
        assert_eq!(jobs.path("default", None), "/apis/batch/v1/namespaces/default/jobs");
        assert_eq!(ResourceType::new("v1", "Ingress").plural, "ingresses");
        assert_eq!(ResourceType::new("v1", "NetworkPolicy").plural, "networkpolicies");
    }

    #[test]
    fn test_merge_patch() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2]});
        merge_patch(&mut target, &json!({"a": null, "b": {"c": 5}, "e": [3], "f": "x"}));
        assert_eq!(target, json!({"b": {"c": 5, "d": 3}, "e": [3], "f": "x"}));
    }

    #[test]
    fn test_set_path() {
        let mut target = json!({});
        set_path(&mut target, &["metadata", "labels", "a"], json!("b"));
        assert_eq!(target, json!({"metadata": {"labels": {"a": "b"}}}));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ResourceType::for_kind_name("configmap").kind, "ConfigMap");
        assert_eq!(ResourceType::for_kind_name("pod").api_version(), "v1");
        assert_eq!(ResourceType::for_kind_name("workflow").group, "argoproj.io");
    }

    #[test]
    fn test_list_params() {
        let params = ListParams::default().labels("workflows.argoproj.io/workflow", "wf");
        assert!(params.matches(&json!({"metadata": {"labels": {"workflows.argoproj.io/workflow": "wf"}}})));
        assert!(!params.matches(&json!({"metadata": {}})));
        assert_eq!(params.selector(), "workflows.argoproj.io/workflow=wf");
    }
}
