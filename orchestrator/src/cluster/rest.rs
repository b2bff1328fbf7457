//! Cluster client over the Kubernetes REST API

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error};
use url::Url;

use super::{ClusterClient, DeleteOptions, ListParams, ResourceType};
use crate::errors::WfError;
use crate::storage::settings::ClusterSettings;

const EXEC_PROTOCOL: &str = "v4.channel.k8s.io";
const MERGE_PATCH: &str = "application/merge-patch+json";

pub struct KubeRestClient {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl KubeRestClient {
    pub fn new(api_server: &str, token: Option<SecretString>, insecure: bool) -> Result<Self, WfError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(insecure)
            .build()?;
        Ok(Self {
            client,
            base_url: api_server.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Client for the configured API server, authenticated with the service-account token
    pub async fn from_settings(settings: &ClusterSettings) -> Result<Self, WfError> {
        let token = match tokio::fs::read_to_string(&settings.token_file).await {
            Ok(token) => Some(SecretString::from(token.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no service account token at {}", settings.token_file);
                None
            }
            Err(e) => return Err(e.into()),
        };
        Self::new(&settings.api_server, token, settings.insecure)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<(&Value, &str)>,
    ) -> Result<Value, WfError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut request = self.client.request(method.clone(), &url).query(query);
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token.expose_secret()));
        }
        if let Some((body, content_type)) = body {
            request = request
                .header(header::CONTENT_TYPE, content_type)
                .body(serde_json::to_vec(body)?);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(text);
            if status.is_server_error() {
                error!("{} {} failed: {} - {}", method, url, status, message);
            }
            return Err(status_error(status, message));
        }
        Ok(response.json().await?)
    }
}

fn status_error(status: StatusCode, message: String) -> WfError {
    match status.as_u16() {
        404 => WfError::NotFound(message),
        409 => WfError::Conflict(message),
        400 | 422 => WfError::BadRequest(message),
        429 | 500..=599 => WfError::Transient(format!("{}: {}", status, message)),
        _ => WfError::Internal(format!("{}: {}", status, message)),
    }
}

#[async_trait]
impl ClusterClient for KubeRestClient {
    async fn get(&self, rt: &ResourceType, namespace: &str, name: &str) -> Result<Value, WfError> {
        self.send(Method::GET, &rt.path(namespace, Some(name)), &[], None).await
    }

    async fn list(&self, rt: &ResourceType, namespace: &str, params: &ListParams) -> Result<Vec<Value>, WfError> {
        let mut query = Vec::new();
        if !params.labels.is_empty() {
            query.push(("labelSelector", params.selector()));
        }
        let list = self.send(Method::GET, &rt.path(namespace, None), &query, None).await?;
        let mut items = match list.get("items") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        // list items omit apiVersion and kind
        for item in &mut items {
            if let Value::Object(map) = item {
                map.entry("apiVersion").or_insert_with(|| Value::String(rt.api_version()));
                map.entry("kind").or_insert_with(|| Value::String(rt.kind.clone()));
            }
        }
        Ok(items)
    }

    async fn create(&self, rt: &ResourceType, namespace: &str, object: &Value) -> Result<Value, WfError> {
        self.send(
            Method::POST,
            &rt.path(namespace, None),
            &[],
            Some((object, "application/json")),
        )
        .await
    }

    async fn update(&self, rt: &ResourceType, namespace: &str, object: &Value) -> Result<Value, WfError> {
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| WfError::BadRequest("object has no name".to_string()))?;
        self.send(
            Method::PUT,
            &rt.path(namespace, Some(name)),
            &[],
            Some((object, "application/json")),
        )
        .await
    }

    async fn patch(&self, rt: &ResourceType, namespace: &str, name: &str, patch: &Value) -> Result<Value, WfError> {
        self.send(
            Method::PATCH,
            &rt.path(namespace, Some(name)),
            &[],
            Some((patch, MERGE_PATCH)),
        )
        .await
    }

    async fn delete(
        &self,
        rt: &ResourceType,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), WfError> {
        let mut body = serde_json::Map::new();
        body.insert("kind".to_string(), Value::String("DeleteOptions".to_string()));
        body.insert("apiVersion".to_string(), Value::String("v1".to_string()));
        if let Some(grace) = options.grace_period_seconds {
            body.insert("gracePeriodSeconds".to_string(), Value::from(grace));
        }
        if let Some(policy) = &options.propagation_policy {
            body.insert("propagationPolicy".to_string(), Value::String(policy.clone()));
        }
        self.send(
            Method::DELETE,
            &rt.path(namespace, Some(name)),
            &[],
            Some((&Value::Object(body), "application/json")),
        )
        .await?;
        Ok(())
    }

    async fn exec_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> Result<String, WfError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| WfError::BadRequest(format!("invalid API server URL: {}", e)))?;
        let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
        url.set_scheme(scheme)
            .map_err(|_| WfError::Internal("cannot switch API server URL to websocket".to_string()))?;
        url.set_path(&format!("/api/v1/namespaces/{}/pods/{}/exec", namespace, pod));
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("container", container);
            query.append_pair("stdout", "true");
            query.append_pair("stderr", "true");
            for arg in argv {
                query.append_pair("command", arg);
            }
        }

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| WfError::Internal(format!("exec request: {}", e)))?;
        let headers = request.headers_mut();
        headers.insert(
            http::header::SEC_WEBSOCKET_PROTOCOL,
            http::HeaderValue::from_static(EXEC_PROTOCOL),
        );
        if let Some(token) = &self.token {
            let value = http::HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| WfError::Internal(format!("invalid token: {}", e)))?;
            headers.insert(http::header::AUTHORIZATION, value);
        }

        debug!("exec in {}/{}/{}: {:?}", namespace, pod, container, argv);
        let (mut stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| WfError::Transient(format!("exec connect failed: {}", e)))?;

        let mut stdout = Vec::new();
        let mut failure = None;
        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| WfError::Transient(format!("exec stream failed: {}", e)))?;
            match message {
                Message::Binary(data) if !data.is_empty() => match data[0] {
                    1 => stdout.extend_from_slice(&data[1..]),
                    2 => debug!("exec stderr: {}", String::from_utf8_lossy(&data[1..])),
                    3 => {
                        let status: Value = serde_json::from_slice(&data[1..]).unwrap_or(Value::Null);
                        if status.get("status").and_then(Value::as_str) != Some("Success") {
                            failure = Some(
                                status
                                    .get("message")
                                    .and_then(Value::as_str)
                                    .unwrap_or("command failed")
                                    .to_string(),
                            );
                        }
                    }
                    _ => {}
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        match failure {
            Some(message) => Err(WfError::Internal(format!("exec failed: {}", message))),
            None => Ok(String::from_utf8_lossy(&stdout).into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_mapping() {
        assert!(status_error(StatusCode::NOT_FOUND, "x".into()).is_not_found());
        assert!(status_error(StatusCode::CONFLICT, "x".into()).is_conflict());
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "x".into()).is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "x".into()).is_transient());
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "x".into()),
            WfError::BadRequest(_)
        ));
    }
}
