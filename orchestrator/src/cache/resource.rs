//! Read-through cache of secrets and config maps
//!
//! Entries are keyed `namespace:kind:name`, e.g. `argo:secret:my-creds`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::lru_ttl::LruTtlCache;
use crate::artifacts::ResourceInterface;
use crate::clock::SharedClock;
use crate::cluster::{self, ResourceType, SharedClient};
use crate::errors::WfError;

const DEFAULT_CAPACITY: usize = 500;
const DEFAULT_TTL: Duration = Duration::from_secs(60);

pub struct ResourceCache {
    client: SharedClient,
    namespace: String,
    entries: LruTtlCache<String, Value>,
}

impl ResourceCache {
    pub fn new(client: SharedClient, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            entries: LruTtlCache::new(DEFAULT_CAPACITY, DEFAULT_TTL),
        }
    }

    pub fn with_clock(client: SharedClient, namespace: &str, ttl: Duration, clock: SharedClock) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            entries: LruTtlCache::with_clock(DEFAULT_CAPACITY, ttl, clock),
        }
    }

    pub fn cache_key(namespace: &str, kind: &str, name: &str) -> String {
        format!("{}:{}:{}", namespace, kind.to_lowercase(), name)
    }

    async fn object(&self, rt: &ResourceType, name: &str) -> Result<Value, WfError> {
        let key = Self::cache_key(&self.namespace, &rt.kind, name);
        if let Some(object) = self.entries.get(&key) {
            return Ok(object);
        }
        debug!("resource cache miss for {}", key);
        let object = self.client.get(rt, &self.namespace, name).await?;
        self.entries.add(key, object.clone());
        Ok(object)
    }

    pub async fn secret(&self, name: &str, key: &str) -> Result<String, WfError> {
        let secret = self.object(&ResourceType::secret(), name).await?;
        cluster::secret_value(&secret, key)
    }

    pub async fn config_map_key(&self, name: &str, key: &str) -> Result<String, WfError> {
        let config_map = self.object(&ResourceType::config_map(), name).await?;
        cluster::config_map_value(&config_map, key)
    }

    /// Drop a cached object so the next read goes to the cluster
    pub fn invalidate(&self, kind: &str, name: &str) {
        self.entries.remove(&Self::cache_key(&self.namespace, kind, name));
    }
}

#[async_trait]
impl ResourceInterface for ResourceCache {
    async fn get_secret(&self, name: &str, key: &str) -> Result<String, WfError> {
        self.secret(name, key).await
    }

    async fn get_config_map_key(&self, name: &str, key: &str) -> Result<String, WfError> {
        self.config_map_key(name, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::{ClusterClient, InMemoryCluster};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_secret_read_through_and_expiry() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster
            .create(
                &ResourceType::secret(),
                "argo",
                &json!({"metadata": {"name": "creds"}, "data": {"password": "aHVudGVyMg=="}}),
            )
            .await
            .unwrap();

        let clock = ManualClock::default();
        let cache = ResourceCache::with_clock(cluster.clone(), "argo", Duration::from_secs(10), Arc::new(clock.clone()));
        assert_eq!(cache.secret("creds", "password").await.unwrap(), "hunter2");

        cluster
            .patch(&ResourceType::secret(), "argo", "creds", &json!({"data": {"password": "bmV3"}}))
            .await
            .unwrap();
        assert_eq!(cache.secret("creds", "password").await.unwrap(), "hunter2");

        clock.advance(chrono::Duration::seconds(11));
        assert_eq!(cache.secret("creds", "password").await.unwrap(), "new");
    }

    #[tokio::test]
    async fn test_config_map_and_missing() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster
            .create(
                &ResourceType::config_map(),
                "argo",
                &json!({"metadata": {"name": "krb"}, "data": {"krb5.conf": "[libdefaults]"}}),
            )
            .await
            .unwrap();
        let cache = ResourceCache::new(cluster, "argo");
        assert_eq!(cache.config_map_key("krb", "krb5.conf").await.unwrap(), "[libdefaults]");
        assert!(cache.secret("absent", "k").await.unwrap_err().is_not_found());
        assert_eq!(ResourceCache::cache_key("argo", "Secret", "creds"), "argo:secret:creds");
    }
}
