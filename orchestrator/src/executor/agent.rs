//! `agent` role: run the HTTP templates of a workflow
//!
//! The controller writes pending HTTP nodes into the `WorkflowTaskSet` named
//! after the workflow. The agent polls it, executes each request, and merges
//! the results back into `status.nodes`.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use workflow_api::template::HttpTemplate;
use workflow_api::{NodePhase, NodeResult, Outputs, WorkflowTaskSet};

use crate::cluster::{Api, SharedClient};
use crate::errors::WfError;
use crate::expr::{self, Env};

/// Polls the task set of one workflow and executes its HTTP tasks
pub struct AgentExecutor {
    client: SharedClient,
    namespace: String,
    workflow_name: String,
}

impl AgentExecutor {
    pub fn new(client: SharedClient, namespace: &str, workflow_name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            workflow_name: workflow_name.to_string(),
        }
    }

    fn task_sets(&self) -> Api<WorkflowTaskSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub async fn run<S, F>(
        &self,
        poll_interval: Duration,
        sleep_fn: S,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Result<(), WfError>
    where
        S: Fn(Duration) -> F,
        F: Future<Output = ()>,
    {
        info!("Agent worker starting for workflow {}...", self.workflow_name);
        loop {
            tokio::select! {
                _ = shutdown_signal.as_mut() => {
                    info!("Agent worker shutting down...");
                    return Ok(());
                }
                _ = sleep_fn(poll_interval) => {
                    match self.process_pending_tasks().await {
                        Ok(0) => {}
                        Ok(n) => info!("agent completed {} task(s)", n),
                        Err(e) if e.is_not_found() => debug!("task set not created yet"),
                        Err(e) => error!("agent failed to process tasks: {}", e),
                    }
                }
            }
        }
    }

    /// Execute every pending HTTP task once; returns how many were reported
    pub async fn process_pending_tasks(&self) -> Result<usize, WfError> {
        let api = self.task_sets();
        let task_set = api.get(&self.workflow_name).await?;
        let mut nodes = Map::new();
        for (node_id, template) in task_set.pending_tasks() {
            let result = match &template.http {
                Some(http) => self.execute_http(http).await,
                None => NodeResult {
                    phase: Some(NodePhase::Error),
                    message: format!("agent cannot run template '{}': only HTTP templates are supported", template.name),
                    ..Default::default()
                },
            };
            info!(node = %node_id, phase = ?result.phase, "task completed");
            nodes.insert(node_id.clone(), serde_json::to_value(&result)?);
        }
        let count = nodes.len();
        if count > 0 {
            api.patch(&self.workflow_name, &json!({"status": {"nodes": nodes}}))
                .await?;
        }
        Ok(count)
    }

    /// Run one HTTP request and decide the node phase
    pub async fn execute_http(&self, http: &HttpTemplate) -> NodeResult {
        match self.send(http).await {
            Ok(result) => result,
            Err(e) => {
                warn!("HTTP task to {} failed: {}", http.url, e);
                NodeResult {
                    phase: Some(NodePhase::Error),
                    message: e.to_string(),
                    ..Default::default()
                }
            }
        }
    }

    async fn send(&self, http: &HttpTemplate) -> Result<NodeResult, WfError> {
        let method = match http.method.as_str() {
            "" => Method::GET,
            m => Method::from_str(&m.to_uppercase())
                .map_err(|_| WfError::BadRequest(format!("invalid HTTP method '{}'", m)))?,
        };
        let body = match &http.body_from {
            Some(source) => base64::engine::general_purpose::STANDARD
                .decode(source.bytes.as_bytes())
                .map_err(|e| WfError::BadRequest(format!("invalid bodyFrom.bytes: {}", e)))?,
            None => http.body.clone().into_bytes(),
        };
        let headers = self.request_headers(http).await?;

        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(http.insecure_skip_verify);
        if let Some(seconds) = http.timeout_seconds {
            builder = builder.timeout(Duration::from_secs(seconds));
        }
        let client = builder.build()?;

        debug!("{} {}", method, http.url);
        let response = client
            .request(method.clone(), &http.url)
            .headers(headers.clone())
            .body(body.clone())
            .send()
            .await?;
        let status = response.status().as_u16();
        let response_headers = headers_json(response.headers());
        let response_body = response.text().await?;

        let outputs = Outputs {
            result: Some(response_body.clone()),
            ..Default::default()
        };
        let mut result = NodeResult {
            outputs: Some(outputs),
            ..Default::default()
        };

        if http.success_condition.is_empty() {
            if (200..300).contains(&status) {
                result.phase = Some(NodePhase::Succeeded);
            } else {
                result.phase = Some(NodePhase::Failed);
                result.message = format!("received non-2xx response code: {}", status);
            }
            return Ok(result);
        }

        let mut env = Env::new();
        env.insert(
            "request",
            json!({
                "method": method.as_str(),
                "url": http.url,
                "body": String::from_utf8_lossy(&body),
                "bodyBytes": body,
                "headers": headers_json(&headers),
            }),
        );
        env.insert(
            "response",
            json!({
                "statusCode": status,
                "body": response_body,
                "headers": response_headers,
            }),
        );
        if expr::eval_bool(&http.success_condition, &env)? {
            result.phase = Some(NodePhase::Succeeded);
        } else {
            result.phase = Some(NodePhase::Failed);
            result.message = format!("successCondition '{}' evaluated false", http.success_condition);
        }
        Ok(result)
    }

    async fn request_headers(&self, http: &HttpTemplate) -> Result<HeaderMap, WfError> {
        let mut headers = HeaderMap::new();
        for header in &http.headers {
            let value = match header.value_from.as_ref().and_then(|v| v.secret_key_ref.as_ref()) {
                Some(selector) => {
                    self.client
                        .get_secret(&self.namespace, &selector.name, &selector.key)
                        .await?
                }
                None => header.value.clone(),
            };
            let name = if header.name.eq_ignore_ascii_case("host") {
                HOST
            } else {
                HeaderName::from_str(&header.name)
                    .map_err(|_| WfError::BadRequest(format!("invalid header name '{}'", header.name)))?
            };
            let value = HeaderValue::from_str(&value)
                .map_err(|_| WfError::BadRequest(format!("invalid value for header '{}'", header.name)))?;
            headers.append(name, value);
        }
        Ok(headers)
    }
}

fn headers_json(headers: &HeaderMap) -> Value {
    let mut out: Map<String, Value> = Map::new();
    for (name, value) in headers {
        let entry = out
            .entry(name.as_str().to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = entry {
            values.push(Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()));
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterClient, InMemoryCluster, ResourceType};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::{get, post};
    use axum::Router;
    use std::sync::Arc;
    use workflow_api::{ObjectMeta, Template};

    async fn serve() -> String {
        let app = Router::new()
            .route("/ok", get(|| async { "hello" }))
            .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "nope") }))
            .route(
                "/echo",
                post(|headers: AxumHeaders, body: String| async move {
                    let token = headers
                        .get("x-token")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    format!("{}:{}", token, body)
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn http(url: &str) -> HttpTemplate {
        HttpTemplate {
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_status_code_decides_phase() {
        let base = serve().await;
        let agent = AgentExecutor::new(Arc::new(InMemoryCluster::new()), "argo", "wf");

        let ok = agent.execute_http(&http(&format!("{}/ok", base))).await;
        assert_eq!(ok.phase, Some(NodePhase::Succeeded));
        assert_eq!(ok.outputs.unwrap().result.as_deref(), Some("hello"));

        let missing = agent.execute_http(&http(&format!("{}/missing", base))).await;
        assert_eq!(missing.phase, Some(NodePhase::Failed));
        assert_eq!(missing.message, "received non-2xx response code: 404");
    }

    #[tokio::test]
    async fn test_success_condition_and_secret_header() {
        let base = serve().await;
        let cluster = Arc::new(InMemoryCluster::new());
        cluster
            .create(
                &ResourceType::secret(),
                "argo",
                &json!({"metadata": {"name": "creds", "namespace": "argo"}, "data": {"token": "czNjcjN0"}}),
            )
            .await
            .unwrap();
        let agent = AgentExecutor::new(cluster, "argo", "wf");
        let template: HttpTemplate = serde_json::from_value(json!({
            "method": "POST",
            "url": format!("{}/echo", base),
            "body": "ping",
            "headers": [{"name": "X-Token", "valueFrom": {"secretKeyRef": {"name": "creds", "key": "token"}}}],
            "successCondition": "response.statusCode == 200 && response.body == \"s3cr3t:ping\"",
        }))
        .unwrap();
        let result = agent.execute_http(&template).await;
        assert_eq!(result.phase, Some(NodePhase::Succeeded), "{}", result.message);

        let mut failing = template.clone();
        failing.success_condition = "response.statusCode == 201".to_string();
        let result = agent.execute_http(&failing).await;
        assert_eq!(result.phase, Some(NodePhase::Failed));
        assert_eq!(result.message, "successCondition 'response.statusCode == 201' evaluated false");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_error() {
        let agent = AgentExecutor::new(Arc::new(InMemoryCluster::new()), "argo", "wf");
        let result = agent.execute_http(&http("http://127.0.0.1:1/x")).await;
        assert_eq!(result.phase, Some(NodePhase::Error));
        assert!(!result.message.is_empty());
    }

    #[tokio::test]
    async fn test_pending_tasks_are_reported_once() {
        let base = serve().await;
        let cluster = Arc::new(InMemoryCluster::new());
        let mut set = WorkflowTaskSet::new(ObjectMeta::named("argo", "wf"));
        set.spec.tasks.insert(
            "wf-1".to_string(),
            Template {
                name: "call".to_string(),
                http: Some(http(&format!("{}/ok", base))),
                ..Default::default()
            },
        );
        let api: Api<WorkflowTaskSet> = Api::namespaced(cluster.clone(), "argo");
        api.create(&set).await.unwrap();

        let agent = AgentExecutor::new(cluster, "argo", "wf");
        assert_eq!(agent.process_pending_tasks().await.unwrap(), 1);
        let stored = api.get("wf").await.unwrap();
        assert_eq!(stored.status.nodes["wf-1"].phase, Some(NodePhase::Succeeded));
        assert_eq!(agent.process_pending_tasks().await.unwrap(), 0);
    }
}
