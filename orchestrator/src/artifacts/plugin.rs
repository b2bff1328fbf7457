//! Artifact plugins served over gRPC on a unix socket
//!
//! The plugin runs as a sidecar and listens on
//! `/tmp/artifact-plugins/<name>/socket`. Every driver call is a unary RPC
//! except `OpenStream`, which streams `{data, error, isEnd}` chunks.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use artifact_plugin_api as pb;
use artifact_plugin_api::paths;
use async_trait::async_trait;
use bytes::Bytes;
use http::uri::PathAndQuery;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Status};
use tracing::{debug, info, warn};
use workflow_api::Artifact;

use super::{save_stream_via_file, ArtifactDriver, ByteStream};
use crate::errors::WfError;

/// How long to wait for the plugin socket to appear
#[derive(Debug, Clone)]
pub struct SocketWait {
    pub max_retries: u32,
    pub interval: Duration,
}

impl Default for SocketWait {
    fn default() -> Self {
        Self {
            max_retries: 120,
            interval: Duration::from_secs(1),
        }
    }
}

pub struct PluginDriver {
    name: String,
    channel: Channel,
}

/// Transport form of an artifact
pub fn convert_to_grpc(artifact: &Artifact) -> pb::Artifact {
    pb::Artifact {
        name: artifact.name.clone(),
        path: artifact.path.clone(),
        mode: artifact.mode.map(|m| m as i32).unwrap_or(0),
        from: artifact.from.clone(),
        optional: artifact.optional,
        sub_path: artifact.sub_path.clone(),
        recurse_mode: artifact.recurse_mode,
        from_expression: artifact.from_expression.clone(),
        deleted: artifact.deleted,
        plugin: artifact.location.plugin.as_ref().map(|p| pb::PluginArtifact {
            name: p.name.clone(),
            configuration: p.configuration.clone(),
            connection_timeout_seconds: p.connection_timeout_seconds.unwrap_or(0),
            key: p.key.clone(),
        }),
    }
}

/// Wait until `path` exists; a file that is not a socket is reported and accepted
pub async fn wait_for_socket(name: &str, path: &Path, wait: &SocketWait) -> Result<(), WfError> {
    for attempt in 0..wait.max_retries.max(1) {
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                if !meta.file_type().is_socket() {
                    warn!("plugin {} path {:?} exists but is not a socket", name, path);
                }
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("waiting for plugin {} socket {:?} (attempt {})", name, path, attempt + 1);
                tokio::time::sleep(wait.interval).await;
            }
            Err(e) => {
                return Err(WfError::Internal(format!(
                    "plugin {} socket {:?} could not be checked: {}",
                    name, path, e
                )))
            }
        }
    }
    Err(WfError::Transient(format!(
        "plugin {} socket {:?} did not appear after {} attempts",
        name, path, wait.max_retries
    )))
}

fn failed(name: &str, op: &str, error: String) -> WfError {
    WfError::Internal(format!("plugin {} {} failed: {}", name, op, error))
}

impl PluginDriver {
    /// Wait for the socket, then connect within `timeout`
    pub async fn connect(
        name: &str,
        socket: &Path,
        timeout: Duration,
        wait: &SocketWait,
    ) -> Result<Self, WfError> {
        wait_for_socket(name, socket, wait).await?;

        let path: PathBuf = socket.to_path_buf();
        // the URI is ignored by the connector
        let endpoint = Endpoint::try_from("http://[::]:50051")
            .map_err(|e| WfError::Internal(format!("plugin {} endpoint: {}", name, e)))?;
        let connect = endpoint.connect_with_connector(tower::service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }));
        let channel = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                WfError::Transient(format!("plugin {} connection timed out after {:?}", name, timeout))
            })?
            .map_err(|e| WfError::Transient(format!("plugin {} connection failed: {}", name, e)))?;

        info!("Connected to artifact plugin {} at {:?}", name, socket);
        Ok(Self {
            name: name.to_string(),
            channel,
        })
    }

    async fn ready(&self) -> Result<tonic::client::Grpc<Channel>, WfError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| WfError::Transient(format!("plugin {} not ready: {}", self.name, e)))?;
        Ok(grpc)
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self
            .ready()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        let response = grpc
            .unary(
                Request::new(request),
                PathAndQuery::from_static(path),
                tonic::codec::ProstCodec::default(),
            )
            .await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl ArtifactDriver for PluginDriver {
    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<(), WfError> {
        let request = pb::LoadArtifactRequest {
            input_artifact: Some(convert_to_grpc(artifact)),
            path: path.to_string_lossy().into_owned(),
        };
        let response: pb::LoadArtifactResponse = self
            .unary(paths::LOAD, request)
            .await
            .map_err(|e| failed(&self.name, "load", e.message().to_string()))?;
        if !response.success {
            return Err(failed(&self.name, "load", response.error));
        }
        Ok(())
    }

    async fn open_stream(&self, artifact: &Artifact) -> Result<ByteStream, WfError> {
        let mut grpc = self.ready().await?;
        let request = pb::OpenStreamRequest {
            artifact: Some(convert_to_grpc(artifact)),
        };
        let streaming = grpc
            .server_streaming::<_, pb::OpenStreamResponse, _>(
                Request::new(request),
                PathAndQuery::from_static(paths::OPEN_STREAM),
                tonic::codec::ProstCodec::default(),
            )
            .await
            .map_err(|e| failed(&self.name, "open stream", e.message().to_string()))?
            .into_inner();

        let name = self.name.clone();
        let stream = futures::stream::unfold(Some(streaming), move |state| {
            let name = name.clone();
            async move {
                let mut streaming = state?;
                match streaming.message().await {
                    Ok(Some(chunk)) if !chunk.error.is_empty() => Some((
                        Err(WfError::Internal(format!("plugin {} stream error: {}", name, chunk.error))),
                        None,
                    )),
                    Ok(Some(chunk)) if chunk.is_end => {
                        if chunk.data.is_empty() {
                            None
                        } else {
                            Some((Ok(Bytes::from(chunk.data)), None))
                        }
                    }
                    Ok(Some(chunk)) => Some((Ok(Bytes::from(chunk.data)), Some(streaming))),
                    Ok(None) => None,
                    Err(status) => Some((
                        Err(WfError::Internal(format!(
                            "plugin {} stream error: {}",
                            name,
                            status.message()
                        ))),
                        None,
                    )),
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn save(&self, path: &Path, artifact: &Artifact) -> Result<(), WfError> {
        let request = pb::SaveArtifactRequest {
            path: path.to_string_lossy().into_owned(),
            output_artifact: Some(convert_to_grpc(artifact)),
        };
        let response: pb::SaveArtifactResponse = self
            .unary(paths::SAVE, request)
            .await
            .map_err(|e| failed(&self.name, "save", e.message().to_string()))?;
        if !response.success {
            return Err(failed(&self.name, "save", response.error));
        }
        Ok(())
    }

    async fn save_stream(&self, stream: ByteStream, artifact: &Artifact) -> Result<(), WfError> {
        save_stream_via_file(self, "plugin-upload-", stream, artifact).await
    }

    async fn delete(&self, artifact: &Artifact) -> Result<(), WfError> {
        let request = pb::DeleteArtifactRequest {
            artifact: Some(convert_to_grpc(artifact)),
        };
        let response: pb::DeleteArtifactResponse = self
            .unary(paths::DELETE, request)
            .await
            .map_err(|e| failed(&self.name, "delete", e.message().to_string()))?;
        if !response.success {
            return Err(failed(&self.name, "delete", response.error));
        }
        Ok(())
    }

    async fn list_objects(&self, artifact: &Artifact) -> Result<Vec<String>, WfError> {
        let request = pb::ListObjectsRequest {
            artifact: Some(convert_to_grpc(artifact)),
        };
        let response: pb::ListObjectsResponse = self
            .unary(paths::LIST_OBJECTS, request)
            .await
            .map_err(|e| failed(&self.name, "list objects", e.message().to_string()))?;
        if !response.error.is_empty() {
            return Err(failed(&self.name, "list objects", response.error));
        }
        Ok(response.objects)
    }

    async fn is_directory(&self, artifact: &Artifact) -> Result<bool, WfError> {
        let request = pb::IsDirectoryRequest {
            artifact: Some(convert_to_grpc(artifact)),
        };
        let response: pb::IsDirectoryResponse = self
            .unary(paths::IS_DIRECTORY, request)
            .await
            .map_err(|e| failed(&self.name, "is directory", e.message().to_string()))?;
        if !response.error.is_empty() {
            return Err(failed(&self.name, "is directory", response.error));
        }
        Ok(response.is_directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_api::artifact::ArtifactLocation;
    use workflow_api::PluginArtifact;

    #[test]
    fn test_convert_to_grpc() {
        let artifact = Artifact {
            name: "model".to_string(),
            path: "/tmp/model".to_string(),
            mode: Some(0o644),
            optional: true,
            sub_path: "weights".to_string(),
            location: ArtifactLocation {
                plugin: Some(PluginArtifact {
                    name: "minio".to_string(),
                    configuration: "bucket: models".to_string(),
                    connection_timeout_seconds: Some(10),
                    key: "runs/1/model".to_string(),
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let grpc = convert_to_grpc(&artifact);
        assert_eq!(grpc.name, "model");
        assert_eq!(grpc.mode, 0o644);
        assert!(grpc.optional);
        assert_eq!(grpc.sub_path, "weights");
        let plugin = grpc.plugin.unwrap();
        assert_eq!(plugin.key, "runs/1/model");
        assert_eq!(plugin.connection_timeout_seconds, 10);
    }

    #[tokio::test]
    async fn test_socket_wait_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let wait = SocketWait {
            max_retries: 2,
            interval: Duration::from_millis(1),
        };
        let err = wait_for_socket("p", &dir.path().join("socket"), &wait)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not appear after 2 attempts"));
    }

    #[tokio::test]
    async fn test_regular_file_is_accepted_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        std::fs::write(&path, "").unwrap();
        assert!(wait_for_socket("p", &path, &SocketWait::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_times_out_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        std::fs::write(&path, "").unwrap();
        let result = PluginDriver::connect("p", &path, Duration::from_millis(200), &SocketWait::default()).await;
        assert!(result.err().unwrap().is_transient());
    }
}
