//! Inline artifact content

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use workflow_api::Artifact;

use super::{not_implemented, ArtifactDriver, ByteStream};
use crate::errors::WfError;
use crate::filesys::file::File;

pub struct RawDriver;

fn data(artifact: &Artifact) -> Result<&str, WfError> {
    artifact
        .location
        .raw
        .as_ref()
        .map(|r| r.data.as_str())
        .ok_or_else(|| WfError::BadRequest(format!("artifact {} is not a raw artifact", artifact.name)))
}

#[async_trait]
impl ArtifactDriver for RawDriver {
    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<(), WfError> {
        File::new(path).write_string(data(artifact)?).await
    }

    async fn open_stream(&self, artifact: &Artifact) -> Result<ByteStream, WfError> {
        let content = Bytes::from(data(artifact)?.to_string());
        Ok(Box::pin(futures::stream::once(async move { Ok(content) })))
    }

    async fn save(&self, _path: &Path, _artifact: &Artifact) -> Result<(), WfError> {
        Err(not_implemented("raw", "save"))
    }

    async fn save_stream(&self, _stream: ByteStream, _artifact: &Artifact) -> Result<(), WfError> {
        Err(not_implemented("raw", "save"))
    }

    async fn delete(&self, _artifact: &Artifact) -> Result<(), WfError> {
        Err(not_implemented("raw", "delete"))
    }

    async fn list_objects(&self, _artifact: &Artifact) -> Result<Vec<String>, WfError> {
        Err(not_implemented("raw", "list objects"))
    }

    async fn is_directory(&self, _artifact: &Artifact) -> Result<bool, WfError> {
        Ok(false)
    }
}
