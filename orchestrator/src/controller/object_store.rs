//! Key/value documents on top of an artifact driver
//!
//! The offload and archive repositories store JSON documents under keys of a
//! base artifact location. Any driver that can save, load, delete and list
//! objects works; the controller uses the volume driver.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use workflow_api::artifact::{ArtifactLocation, VolumeArtifact};
use workflow_api::Artifact;

use crate::artifacts::volume::VolumeDriver;
use crate::artifacts::{ArtifactDriver, ByteStream};
use crate::errors::WfError;

#[derive(Clone)]
pub struct ObjectStore {
    driver: Arc<dyn ArtifactDriver>,
    base: Artifact,
}

impl ObjectStore {
    pub fn new(driver: Arc<dyn ArtifactDriver>, base: Artifact) -> Self {
        Self { driver, base }
    }

    /// Store rooted at `<root>/<volume>`
    pub fn on_volume(root: &Path, volume: &str) -> Self {
        let base = Artifact {
            name: volume.to_string(),
            location: ArtifactLocation {
                volume: Some(VolumeArtifact {
                    name: volume.to_string(),
                    path: String::new(),
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        Self::new(Arc::new(VolumeDriver::new(root)), base)
    }

    fn artifact(&self, key: &str) -> Result<Artifact, WfError> {
        let mut artifact = self.base.clone();
        artifact.location.set_key(key).map_err(WfError::BadRequest)?;
        Ok(artifact)
    }

    pub async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), WfError> {
        let stream: ByteStream = Box::pin(futures::stream::once(async move { Ok(Bytes::from(data)) }));
        self.driver.save_stream(stream, &self.artifact(key)?).await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, WfError> {
        let stream = match self.driver.open_stream(&self.artifact(key)?).await {
            Ok(stream) => stream,
            Err(e) if e.is_not_found() => return Err(WfError::NotFound(format!("object {} not found", key))),
            Err(e) => return Err(e),
        };
        let chunks: Vec<Bytes> = stream.try_collect().await?;
        Ok(chunks.concat())
    }

    pub async fn delete(&self, key: &str) -> Result<(), WfError> {
        self.driver.delete(&self.artifact(key)?).await
    }

    /// Keys below `prefix`
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, WfError> {
        let mut keys = self.driver.list_objects(&self.artifact(prefix)?).await?;
        keys.sort();
        Ok(keys)
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), WfError> {
        self.put(key, serde_json::to_vec(value)?).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, WfError> {
        Ok(serde_json::from_slice(&self.get(key).await?)?)
    }
}
