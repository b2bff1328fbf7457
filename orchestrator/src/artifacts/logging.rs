use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn};
use workflow_api::Artifact;

use super::{ArtifactDriver, ByteStream};
use crate::errors::WfError;

/// Logs every driver call with its key and duration
pub struct LoggingDriver {
    inner: Box<dyn ArtifactDriver>,
}

impl LoggingDriver {
    pub fn new(inner: Box<dyn ArtifactDriver>) -> Self {
        Self { inner }
    }
}

fn log<T>(operation: &str, artifact: &Artifact, started: Instant, result: &Result<T, WfError>) {
    let key = artifact.location.key().unwrap_or_default();
    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(_) => info!(artifact = %artifact.name, key = %key, operation, duration_ms, "artifact operation"),
        Err(e) => warn!(
            artifact = %artifact.name,
            key = %key,
            operation,
            duration_ms,
            error = %e,
            "artifact operation failed"
        ),
    }
}

#[async_trait]
impl ArtifactDriver for LoggingDriver {
    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<(), WfError> {
        let started = Instant::now();
        let result = self.inner.load(artifact, path).await;
        log("load", artifact, started, &result);
        result
    }

    async fn open_stream(&self, artifact: &Artifact) -> Result<ByteStream, WfError> {
        let started = Instant::now();
        let result = self.inner.open_stream(artifact).await;
        log("open_stream", artifact, started, &result);
        result
    }

    async fn save(&self, path: &Path, artifact: &Artifact) -> Result<(), WfError> {
        let started = Instant::now();
        let result = self.inner.save(path, artifact).await;
        log("save", artifact, started, &result);
        result
    }

    async fn save_stream(&self, stream: ByteStream, artifact: &Artifact) -> Result<(), WfError> {
        let started = Instant::now();
        let result = self.inner.save_stream(stream, artifact).await;
        log("save_stream", artifact, started, &result);
        result
    }

    async fn delete(&self, artifact: &Artifact) -> Result<(), WfError> {
        let started = Instant::now();
        let result = self.inner.delete(artifact).await;
        log("delete", artifact, started, &result);
        result
    }

    async fn list_objects(&self, artifact: &Artifact) -> Result<Vec<String>, WfError> {
        let started = Instant::now();
        let result = self.inner.list_objects(artifact).await;
        log("list_objects", artifact, started, &result);
        result
    }

    async fn is_directory(&self, artifact: &Artifact) -> Result<bool, WfError> {
        let started = Instant::now();
        let result = self.inner.is_directory(artifact).await;
        log("is_directory", artifact, started, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::raw::RawDriver;
    use workflow_api::artifact::{ArtifactLocation, RawArtifact};

    #[tokio::test]
    async fn test_results_pass_through() {
        let driver = LoggingDriver::new(Box::new(RawDriver));
        let artifact = Artifact {
            name: "r".to_string(),
            location: ArtifactLocation {
                raw: Some(RawArtifact {
                    data: "hello".to_string(),
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        driver.load(&artifact, &path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        assert!(!driver.is_directory(&artifact).await.unwrap());
        assert!(matches!(driver.delete(&artifact).await, Err(WfError::NotImplemented(_))));
    }
}
