//! List-based informer with a read-only local store
//!
//! Every resync lists the watched objects, replaces the store and dispatches
//! `Added`, `Updated` and `Deleted` events for whatever changed since the
//! previous list. Handlers must not block; they only enqueue keys.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info};
use workflow_api::meta::Resource;

use super::{Api, ListParams};
use crate::errors::WfError;

#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Added(T),
    Updated { old: T, new: T },
    Deleted(T),
}

impl<T: Resource> WatchEvent<T> {
    /// Store key of the object the event is about
    pub fn key(&self) -> String {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Deleted(obj) => obj.key(),
            WatchEvent::Updated { new, .. } => new.key(),
        }
    }
}

pub type EventHandler<T> = Box<dyn Fn(&WatchEvent<T>) + Send + Sync>;

/// Objects keyed `namespace/name`
pub struct Store<T> {
    items: Arc<RwLock<HashMap<String, T>>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T: Resource> Default for Store<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T: Resource> Store<T> {
    pub fn get(&self, key: &str) -> Option<T> {
        self.items.read().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        self.items.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write through an object the caller just persisted, so later reads do
    /// not see the older copy before the next resync
    pub fn upsert(&self, object: T) {
        let key = object.key();
        self.items.write().unwrap_or_else(|e| e.into_inner()).insert(key, object);
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        self.items.write().unwrap_or_else(|e| e.into_inner()).remove(key)
    }

    fn replace(&self, items: HashMap<String, T>) -> HashMap<String, T> {
        let mut guard = self.items.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, items)
    }
}

pub struct Informer<T> {
    api: Api<T>,
    params: ListParams,
    store: Store<T>,
    handlers: RwLock<Vec<EventHandler<T>>>,
    synced: AtomicBool,
}

impl<T> Informer<T>
where
    T: Resource + Serialize + DeserializeOwned,
{
    pub fn new(api: Api<T>, params: ListParams) -> Self {
        Self {
            api,
            params,
            store: Store::default(),
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> Store<T> {
        self.store.clone()
    }

    pub fn add_handler<F>(&self, handler: F)
    where
        F: Fn(&WatchEvent<T>) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(handler));
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// List once, refresh the store and dispatch the differences
    pub async fn resync(&self) -> Result<usize, WfError> {
        let listed = self.api.list(&self.params).await?;
        let fresh: HashMap<String, T> = listed.into_iter().map(|o| (o.key(), o)).collect();
        let previous = self.store.replace(fresh.clone());

        let mut events = Vec::new();
        for (key, new) in &fresh {
            match previous.get(key) {
                None => events.push(WatchEvent::Added(new.clone())),
                Some(old) if old.meta().resource_version != new.meta().resource_version => {
                    events.push(WatchEvent::Updated {
                        old: old.clone(),
                        new: new.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        for (key, old) in previous {
            if !fresh.contains_key(&key) {
                events.push(WatchEvent::Deleted(old));
            }
        }

        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        for event in &events {
            for handler in handlers.iter() {
                handler(event);
            }
        }
        self.synced.store(true, Ordering::SeqCst);
        Ok(events.len())
    }

    /// Relist every `resync_period` until shutdown
    pub async fn run<S, F>(
        &self,
        resync_period: Duration,
        sleep_fn: S,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) where
        S: Fn(Duration) -> F,
        F: Future<Output = ()>,
    {
        info!("{} informer starting", T::KIND);
        loop {
            match self.resync().await {
                Ok(changes) if changes > 0 => debug!("{} informer dispatched {} events", T::KIND, changes),
                Ok(_) => {}
                Err(e) => error!("{} informer failed to list: {}", T::KIND, e),
            }
            tokio::select! {
                _ = sleep_fn(resync_period) => {}
                _ = &mut shutdown_signal => {
                    info!("{} informer shutting down", T::KIND);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterClient, DeleteOptions, InMemoryCluster, SharedClient};
    use std::sync::Mutex;
    use workflow_api::{ObjectMeta, Pod};

    #[tokio::test]
    async fn test_resync_dispatches_changes() {
        let cluster: SharedClient = Arc::new(InMemoryCluster::new());
        let api: Api<Pod> = Api::namespaced(cluster.clone(), "argo");
        let informer = Informer::new(api.clone(), ListParams::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        informer.add_handler(move |event: &WatchEvent<Pod>| {
            let label = match event {
                WatchEvent::Added(p) => format!("added {}", p.metadata.name),
                WatchEvent::Updated { new, .. } => format!("updated {}", new.metadata.name),
                WatchEvent::Deleted(p) => format!("deleted {}", p.metadata.name),
            };
            sink.lock().unwrap().push(label);
        });

        let pod = Pod {
            metadata: ObjectMeta::named("argo", "p"),
            ..Default::default()
        };
        api.create(&pod).await.unwrap();
        informer.resync().await.unwrap();
        assert!(informer.has_synced());
        assert_eq!(informer.store().len(), 1);

        informer.resync().await.unwrap();
        api.patch("p", &serde_json::json!({"metadata": {"labels": {"a": "b"}}})).await.unwrap();
        informer.resync().await.unwrap();
        cluster
            .delete(api.resource_type(), "argo", "p", &DeleteOptions::default())
            .await
            .unwrap();
        informer.resync().await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["added p".to_string(), "updated p".to_string(), "deleted p".to_string()]
        );
        assert!(informer.store().is_empty());
    }
}
