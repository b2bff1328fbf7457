//! HTTP and Artifactory artifacts

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Body, Client, RequestBuilder, Response};
use tracing::{debug, error};
use workflow_api::Artifact;

use super::{not_implemented, write_stream, ArtifactDriver, ByteStream};
use crate::errors::WfError;

pub struct HttpDriver {
    kind: &'static str,
    client: Client,
    username: Option<String>,
    password: Option<String>,
}

impl HttpDriver {
    pub fn new(kind: &'static str, username: Option<String>, password: Option<String>) -> Result<Self, WfError> {
        let client = Client::builder().timeout(Duration::from_secs(300)).build()?;
        Ok(Self {
            kind,
            client,
            username,
            password,
        })
    }

    fn target(&self, artifact: &Artifact) -> Result<(String, Vec<(String, String)>), WfError> {
        if let Some(h) = &artifact.location.http {
            let headers = h.headers.iter().map(|h| (h.name.clone(), h.value.clone())).collect();
            return Ok((h.url.clone(), headers));
        }
        if let Some(a) = &artifact.location.artifactory {
            return Ok((a.url.clone(), Vec::new()));
        }
        Err(WfError::BadRequest(format!(
            "artifact {} has no {} location",
            artifact.name, self.kind
        )))
    }

    fn request(&self, method: reqwest::Method, url: &str, headers: &[(String, String)]) -> RequestBuilder {
        debug!("{} {}", method, url);
        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if self.username.is_some() || self.password.is_some() {
            request = request.basic_auth(
                self.username.clone().unwrap_or_default(),
                self.password.clone(),
            );
        }
        request
    }

    async fn check(&self, response: Response, context: &str) -> Result<Response, WfError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("{} {} failed: {} - {}", self.kind, context, status, body);
            if status.as_u16() == 404 {
                return Err(WfError::NotFound(format!("{}: {}", context, status)));
            }
            return Err(WfError::Internal(format!("{}: {}", context, status)));
        }
        Ok(response)
    }

    async fn get(&self, artifact: &Artifact) -> Result<Response, WfError> {
        let (url, headers) = self.target(artifact)?;
        let response = self.request(reqwest::Method::GET, &url, &headers).send().await?;
        self.check(response, "could not get input artifact").await
    }

    async fn put(&self, artifact: &Artifact, body: Body) -> Result<(), WfError> {
        let (url, headers) = self.target(artifact)?;
        let response = self.request(reqwest::Method::PUT, &url, &headers).body(body).send().await?;
        self.check(response, "could not put output artifact").await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactDriver for HttpDriver {
    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<(), WfError> {
        let stream = self.open_stream(artifact).await?;
        write_stream(stream, path).await?;
        Ok(())
    }

    async fn open_stream(&self, artifact: &Artifact) -> Result<ByteStream, WfError> {
        let response = self.get(artifact).await?;
        Ok(Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(WfError::from))))
    }

    async fn save(&self, path: &Path, artifact: &Artifact) -> Result<(), WfError> {
        if tokio::fs::metadata(path).await?.is_dir() {
            return Err(WfError::BadRequest(format!(
                "{} artifact {} must be a file, {:?} is a directory",
                self.kind, artifact.name, path
            )));
        }
        let file = tokio::fs::File::open(path).await?;
        self.put(artifact, Body::from(file)).await
    }

    async fn save_stream(&self, stream: ByteStream, artifact: &Artifact) -> Result<(), WfError> {
        self.put(artifact, Body::wrap_stream(stream)).await
    }

    async fn delete(&self, _artifact: &Artifact) -> Result<(), WfError> {
        Err(not_implemented(self.kind, "delete"))
    }

    async fn list_objects(&self, _artifact: &Artifact) -> Result<Vec<String>, WfError> {
        Err(not_implemented(self.kind, "list objects"))
    }

    async fn is_directory(&self, _artifact: &Artifact) -> Result<bool, WfError> {
        Err(not_implemented(self.kind, "is directory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use std::sync::{Arc, Mutex};
    use workflow_api::artifact::{ArtifactLocation, Header, HttpArtifact};

    type Stored = Arc<Mutex<Option<(Vec<u8>, Option<String>)>>>;

    async fn serve(stored: Stored) -> String {
        async fn fetch(State(stored): State<Stored>) -> Result<Vec<u8>, StatusCode> {
            stored
                .lock()
                .unwrap()
                .as_ref()
                .map(|(body, _)| body.clone())
                .ok_or(StatusCode::NOT_FOUND)
        }
        async fn store(State(stored): State<Stored>, headers: HeaderMap, body: Bytes) -> StatusCode {
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            *stored.lock().unwrap() = Some((body.to_vec(), auth));
            StatusCode::CREATED
        }
        let app = Router::new()
            .route("/files/out.bin", get(fetch).put(store))
            .with_state(stored);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn artifact(base: &str) -> Artifact {
        Artifact {
            name: "out".to_string(),
            location: ArtifactLocation {
                http: Some(HttpArtifact {
                    url: format!("{}/files/out.bin", base),
                    headers: vec![Header {
                        name: "X-Test".to_string(),
                        value: "1".to_string(),
                    }],
                    auth: None,
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_put_then_get_round_trips_bytes() {
        let stored: Stored = Arc::new(Mutex::new(None));
        let base = serve(stored.clone()).await;
        let driver = HttpDriver::new("http", Some("user".to_string()), Some("pass".to_string())).unwrap();
        let a = artifact(&base);

        let missing = driver.load(&a, Path::new("/nonexistent/x")).await.unwrap_err();
        assert!(missing.is_not_found());

        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::write(&src, b"binary\x00data").unwrap();
        driver.save(&src, &a).await.unwrap();
        let auth = stored.lock().unwrap().as_ref().unwrap().1.clone().unwrap();
        assert!(auth.starts_with("Basic "));

        let dest = tmp.path().join("dest");
        driver.load(&a, &dest).await.unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"binary\x00data");
        assert!(matches!(driver.delete(&a).await, Err(WfError::NotImplemented(_))));
    }
}
