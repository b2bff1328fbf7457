//! HDFS artifacts over the WebHDFS REST API

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, error, info};
use workflow_api::{Artifact, HdfsArtifact};

use super::{save_stream_via_file, secret_opt, write_stream, ArtifactDriver, ByteStream, ResourceInterface};
use crate::errors::WfError;

const DEFAULT_USER: &str = "root";

pub struct HdfsDriver {
    client: Client,
    addresses: Vec<String>,
    user: String,
    force: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileStatus {
    #[serde(default)]
    path_suffix: String,
    #[serde(rename = "type")]
    file_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileStatusResponse {
    file_status: FileStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileStatusesInner {
    file_status: Vec<FileStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListStatusResponse {
    file_statuses: FileStatusesInner,
}

fn hdfs_location(artifact: &Artifact) -> Result<&HdfsArtifact, WfError> {
    artifact
        .location
        .hdfs
        .as_ref()
        .ok_or_else(|| WfError::BadRequest(format!("artifact {} is not an hdfs artifact", artifact.name)))
}

impl HdfsDriver {
    /// Build a driver authenticating with `user.name`
    ///
    /// Kerberos settings are validated and their secrets resolved, then
    /// rejected with `NotImplemented`: the driver does not speak SPNEGO.
    pub async fn create(resources: &dyn ResourceInterface, hdfs: &HdfsArtifact) -> Result<Self, WfError> {
        if hdfs.addresses.is_empty() {
            return Err(WfError::BadRequest("hdfs addresses must not be empty".to_string()));
        }
        let kerberos = hdfs.krb_c_cache_secret.is_some() || hdfs.krb_keytab_secret.is_some();
        if kerberos {
            if hdfs.krb_keytab_secret.is_some() && (hdfs.krb_username.is_empty() || hdfs.krb_realm.is_empty()) {
                return Err(WfError::BadRequest(
                    "krbUsername and krbRealm are required with krbKeytabSecret".to_string(),
                ));
            }
            if hdfs.krb_config_config_map.is_none() {
                return Err(WfError::BadRequest(
                    "krbConfigConfigMap is required with kerberos authentication".to_string(),
                ));
            }
            // resolve the secrets so a missing one is reported as such
            secret_opt(resources, hdfs.krb_c_cache_secret.as_ref()).await?;
            secret_opt(resources, hdfs.krb_keytab_secret.as_ref()).await?;
            return Err(WfError::NotImplemented(
                "kerberos authentication is not supported by the hdfs driver".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            client,
            addresses: hdfs.addresses.clone(),
            user: if hdfs.hdfs_user.is_empty() {
                DEFAULT_USER.to_string()
            } else {
                hdfs.hdfs_user.clone()
            },
            force: hdfs.force,
        })
    }

    fn url(&self, address: &str, path: &str, op: &str, extra: &str) -> String {
        let base = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        format!(
            "{}/webhdfs/v1/{}?op={}&user.name={}{}",
            base,
            path.trim_start_matches('/'),
            op,
            self.user,
            extra
        )
    }

    /// Send to each name node in turn until one answers
    async fn send(
        &self,
        method: Method,
        path: &str,
        op: &str,
        extra: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response, WfError> {
        let mut last_err = None;
        for address in &self.addresses {
            let url = self.url(address, path, op, extra);
            debug!("{} {}", method, url);
            let mut request = self.client.request(method.clone(), &url);
            if let Some(body) = &body {
                request = request.body(body.clone());
            }
            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e.into()),
            None => Err(WfError::BadRequest("hdfs addresses must not be empty".to_string())),
        }
    }

    async fn check(response: Response, context: &str) -> Result<Response, WfError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(WfError::NotFound(format!("{}: {}", context, status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("WebHDFS {} failed: {} - {}", context, status, body);
            return Err(WfError::Internal(format!("{}: {}", context, status)));
        }
        Ok(response)
    }

    async fn status(&self, path: &str) -> Result<Option<FileStatus>, WfError> {
        let response = self.send(Method::GET, path, "GETFILESTATUS", "", None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, "could not stat hdfs path").await?;
        Ok(Some(response.json::<FileStatusResponse>().await?.file_status))
    }

    async fn remove(&self, path: &str, recursive: bool) -> Result<(), WfError> {
        let extra = if recursive { "&recursive=true" } else { "" };
        let response = self.send(Method::DELETE, path, "DELETE", extra, None).await?;
        Self::check(response, "could not delete hdfs path").await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactDriver for HdfsDriver {
    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<(), WfError> {
        let hdfs = hdfs_location(artifact)?;
        if let Some(status) = self.status(&hdfs.path).await? {
            if status.file_type == "DIRECTORY" {
                return Err(WfError::BadRequest(format!(
                    "hdfs path {} is a directory, only files can be loaded",
                    hdfs.path
                )));
            }
        }
        let stream = self.open_stream(artifact).await?;
        write_stream(stream, path).await?;
        Ok(())
    }

    async fn open_stream(&self, artifact: &Artifact) -> Result<ByteStream, WfError> {
        let hdfs = hdfs_location(artifact)?;
        let response = self.send(Method::GET, &hdfs.path, "OPEN", "", None).await?;
        let response = Self::check(response, "could not get input artifact").await?;
        Ok(Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(WfError::from))))
    }

    async fn save(&self, path: &Path, artifact: &Artifact) -> Result<(), WfError> {
        let hdfs = hdfs_location(artifact)?;
        if tokio::fs::metadata(path).await?.is_dir() {
            return Err(WfError::BadRequest(format!(
                "hdfs output {} must be a file, {:?} is a directory",
                artifact.name, path
            )));
        }
        if self.force && self.status(&hdfs.path).await?.is_some() {
            info!("Removing existing hdfs file {}", hdfs.path);
            self.remove(&hdfs.path, false).await?;
        }
        let content = tokio::fs::read(path).await?;
        let extra = if self.force { "&overwrite=true" } else { "&overwrite=false" };
        let response = self
            .send(Method::PUT, &hdfs.path, "CREATE", extra, Some(content))
            .await?;
        Self::check(response, "could not put output artifact").await?;
        Ok(())
    }

    async fn save_stream(&self, stream: ByteStream, artifact: &Artifact) -> Result<(), WfError> {
        save_stream_via_file(self, "hdfs-upload-", stream, artifact).await
    }

    async fn delete(&self, artifact: &Artifact) -> Result<(), WfError> {
        let hdfs = hdfs_location(artifact)?;
        self.remove(&hdfs.path, true).await
    }

    async fn list_objects(&self, artifact: &Artifact) -> Result<Vec<String>, WfError> {
        let hdfs = hdfs_location(artifact)?;
        let base = hdfs.path.trim_end_matches('/');
        let response = self.send(Method::GET, base, "LISTSTATUS", "", None).await?;
        let response = Self::check(response, "could not list hdfs path").await?;
        let listing: ListStatusResponse = response.json().await?;
        Ok(listing
            .file_statuses
            .file_status
            .into_iter()
            .map(|s| {
                if s.path_suffix.is_empty() {
                    base.to_string()
                } else {
                    format!("{}/{}", base, s.path_suffix)
                }
            })
            .collect())
    }

    async fn is_directory(&self, artifact: &Artifact) -> Result<bool, WfError> {
        let hdfs = hdfs_location(artifact)?;
        match self.status(&hdfs.path).await? {
            Some(status) => Ok(status.file_type == "DIRECTORY"),
            None => Err(WfError::NotFound(format!("hdfs path {} not found", hdfs.path))),
        }
    }
}
