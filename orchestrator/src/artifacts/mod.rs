//! Artifact drivers
//!
//! Every storage kind implements [`ArtifactDriver`]. [`new_driver`] picks the
//! driver from the artifact's single populated location and wraps it in the
//! logging decorator.

pub mod git;
pub mod hdfs;
pub mod http;
pub mod logging;
pub mod plugin;
pub mod raw;
pub mod volume;

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use workflow_api::artifact::LocationKind;
use workflow_api::meta::SecretKeySelector;
use workflow_api::Artifact;

use crate::errors::WfError;

/// Chunks of an artifact's content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, WfError>> + Send>>;

#[async_trait]
pub trait ArtifactDriver: Send + Sync {
    /// Download `artifact` to the local `path`
    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<(), WfError>;

    async fn open_stream(&self, artifact: &Artifact) -> Result<ByteStream, WfError>;

    /// Upload the local `path` to `artifact`
    async fn save(&self, path: &Path, artifact: &Artifact) -> Result<(), WfError>;

    async fn save_stream(&self, stream: ByteStream, artifact: &Artifact) -> Result<(), WfError>;

    async fn delete(&self, artifact: &Artifact) -> Result<(), WfError>;

    /// Keys below the artifact's location
    async fn list_objects(&self, artifact: &Artifact) -> Result<Vec<String>, WfError>;

    async fn is_directory(&self, artifact: &Artifact) -> Result<bool, WfError>;
}

/// Credential lookups available to drivers
#[async_trait]
pub trait ResourceInterface: Send + Sync {
    async fn get_secret(&self, name: &str, key: &str) -> Result<String, WfError>;

    async fn get_config_map_key(&self, name: &str, key: &str) -> Result<String, WfError>;
}

/// Builds drivers for artifacts
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn new_driver(&self, artifact: &Artifact) -> Result<Box<dyn ArtifactDriver>, WfError>;
}

pub(crate) fn not_implemented(driver: &str, operation: &str) -> WfError {
    WfError::NotImplemented(format!("{} is not supported by the {} driver", operation, driver))
}

pub(crate) async fn secret_opt(
    resources: &dyn ResourceInterface,
    selector: Option<&SecretKeySelector>,
) -> Result<Option<String>, WfError> {
    match selector {
        Some(s) if !s.name.is_empty() => Ok(Some(resources.get_secret(&s.name, &s.key).await?)),
        _ => Ok(None),
    }
}

/// Stream the contents of a local file
pub async fn stream_file(path: &Path) -> Result<ByteStream, WfError> {
    let file = tokio::fs::File::open(path).await?;
    Ok(Box::pin(ReaderStream::new(file).map(|chunk| chunk.map_err(WfError::from))))
}

/// Drain `stream` into a local file, creating parent directories
pub async fn write_stream(mut stream: ByteStream, path: &Path) -> Result<u64, WfError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

/// Save a stream by spooling it to a temp file and calling `save`
pub async fn save_stream_via_file(
    driver: &dyn ArtifactDriver,
    prefix: &str,
    stream: ByteStream,
    artifact: &Artifact,
) -> Result<(), WfError> {
    let temp = tempfile::Builder::new().prefix(prefix).tempfile()?;
    let path = temp.path().to_path_buf();
    write_stream(stream, &path).await?;
    let result = driver.save(&path, artifact).await;
    drop(temp);
    result
}

/// Driver factory used by the executor and the controller
pub struct DefaultDriverFactory {
    resources: Arc<dyn ResourceInterface>,
    volume_root: PathBuf,
    plugin_socket_dir: PathBuf,
    plugin_wait: plugin::SocketWait,
}

impl DefaultDriverFactory {
    pub fn new(resources: Arc<dyn ResourceInterface>) -> Self {
        Self {
            resources,
            volume_root: PathBuf::from(volume::DEFAULT_VOLUME_ROOT),
            plugin_socket_dir: PathBuf::from(workflow_api::common::ARTIFACT_PLUGIN_SOCKET_DIR),
            plugin_wait: plugin::SocketWait::default(),
        }
    }

    /// Resolve volume artifacts below `root` instead of `/mnt`
    pub fn with_volume_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.volume_root = root.into();
        self
    }

    pub fn with_plugin_sockets(mut self, dir: impl Into<PathBuf>, wait: plugin::SocketWait) -> Self {
        self.plugin_socket_dir = dir.into();
        self.plugin_wait = wait;
        self
    }

    async fn build(&self, artifact: &Artifact) -> Result<Box<dyn ArtifactDriver>, WfError> {
        let kind = artifact.location.kind().map_err(WfError::BadRequest)?;
        let resources = self.resources.as_ref();
        let location = &artifact.location;
        Ok(match kind {
            Some(LocationKind::Git) => {
                let git = location.git.as_ref().ok_or_else(|| unsupported(artifact))?;
                Box::new(git::GitDriver {
                    username: secret_opt(resources, git.username_secret.as_ref()).await?,
                    password: secret_opt(resources, git.password_secret.as_ref()).await?,
                    ssh_private_key: secret_opt(resources, git.ssh_private_key_secret.as_ref()).await?,
                    insecure_ignore_host_key: git.insecure_ignore_host_key,
                    disable_submodules: git.disable_submodules,
                })
            }
            Some(LocationKind::Artifactory) => {
                let a = location.artifactory.as_ref().ok_or_else(|| unsupported(artifact))?;
                Box::new(http::HttpDriver::new(
                    "artifactory",
                    secret_opt(resources, a.username_secret.as_ref()).await?,
                    secret_opt(resources, a.password_secret.as_ref()).await?,
                )?)
            }
            Some(LocationKind::Http) => {
                let h = location.http.as_ref().ok_or_else(|| unsupported(artifact))?;
                let basic = h.auth.as_ref().and_then(|a| a.basic_auth.as_ref());
                Box::new(http::HttpDriver::new(
                    "http",
                    secret_opt(resources, basic.and_then(|b| b.username_secret.as_ref())).await?,
                    secret_opt(resources, basic.and_then(|b| b.password_secret.as_ref())).await?,
                )?)
            }
            Some(LocationKind::Hdfs) => {
                let h = location.hdfs.as_ref().ok_or_else(|| unsupported(artifact))?;
                Box::new(hdfs::HdfsDriver::create(resources, h).await?)
            }
            Some(LocationKind::Raw) => Box::new(raw::RawDriver),
            Some(LocationKind::Volume) => Box::new(volume::VolumeDriver::new(&self.volume_root)),
            Some(LocationKind::Plugin) => {
                let p = location.plugin.as_ref().ok_or_else(|| unsupported(artifact))?;
                let timeout = Duration::from_secs(
                    p.connection_timeout_seconds.filter(|s| *s > 0).unwrap_or(5) as u64,
                );
                let socket = self.plugin_socket_dir.join(&p.name).join("socket");
                Box::new(plugin::PluginDriver::connect(&p.name, &socket, timeout, &self.plugin_wait).await?)
            }
            None => return Err(unsupported(artifact)),
        })
    }
}

fn unsupported(artifact: &Artifact) -> WfError {
    WfError::BadRequest(format!("unsupported artifact driver for artifact {}", artifact.name))
}

#[async_trait]
impl DriverFactory for DefaultDriverFactory {
    async fn new_driver(&self, artifact: &Artifact) -> Result<Box<dyn ArtifactDriver>, WfError> {
        let driver = self.build(artifact).await?;
        Ok(Box::new(logging::LoggingDriver::new(driver)))
    }
}

/// Driver for `artifact` with credentials from `resources`
pub async fn new_driver(
    artifact: &Artifact,
    resources: Arc<dyn ResourceInterface>,
) -> Result<Box<dyn ArtifactDriver>, WfError> {
    DefaultDriverFactory::new(resources).new_driver(artifact).await
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// Credentials served from a map keyed `name/key`
    #[derive(Default)]
    pub struct StaticResources {
        pub values: HashMap<String, String>,
    }

    impl StaticResources {
        pub fn with(mut self, name: &str, key: &str, value: &str) -> Self {
            self.values.insert(format!("{}/{}", name, key), value.to_string());
            self
        }
    }

    #[async_trait]
    impl ResourceInterface for StaticResources {
        async fn get_secret(&self, name: &str, key: &str) -> Result<String, WfError> {
            self.values
                .get(&format!("{}/{}", name, key))
                .cloned()
                .ok_or_else(|| WfError::NotFound(format!("secret {}/{}", name, key)))
        }

        async fn get_config_map_key(&self, name: &str, key: &str) -> Result<String, WfError> {
            self.get_secret(name, key).await
        }
    }
}
