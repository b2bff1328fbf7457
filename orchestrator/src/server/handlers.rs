//! HTTP request handlers

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Path, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::errors::WfError;
use crate::server::state::ServerState;
use crate::utils::version_info;
use crate::webhook::Event;

/// Largest webhook body accepted
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Service account resolved by [`authorize_webhook`]
#[derive(Debug, Clone)]
pub struct ServiceAccount(pub String);

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: version_info().version,
    })
}

/// Verify the sender and inject its service account's bearer token
pub async fn authorize_webhook(
    State(state): State<Arc<ServerState>>,
    Path((namespace, _discriminator)): Path<(String, String)>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Rejecting webhook body: {}", e);
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };

    let Some(service_account) = state
        .verifier
        .identify(&parts.headers, &body)
        .map(str::to_string)
    else {
        debug!(namespace = %namespace, "no webhook client verified the request");
        return error_response(StatusCode::FORBIDDEN, "webhook signature not verified");
    };

    let token = match state.verifier.token(&namespace, &service_account).await {
        Ok(token) => token,
        Err(e) => {
            error!(service_account = %service_account, "Failed to read service account token: {}", e);
            return error_response(status_for(&e), "failed to authorize webhook");
        }
    };
    let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid service account token");
    };
    parts.headers.insert(AUTHORIZATION, value);
    parts.extensions.insert(ServiceAccount(service_account));

    next.run(Request::from_parts(parts, Body::from(body))).await
}

/// Event handler
pub async fn event_handler(
    State(state): State<Arc<ServerState>>,
    Path((namespace, discriminator)): Path<(String, String)>,
    Extension(ServiceAccount(service_account)): Extension<ServiceAccount>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: Value = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
        }
    };
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let event = Event {
        namespace,
        discriminator,
        payload,
        service_account,
        authorization,
    };

    match state.dispatcher.dispatch(event).await {
        Ok(()) => (StatusCode::OK, Json(json!({}))).into_response(),
        Err(e) => {
            warn!("Failed to dispatch event: {}", e);
            error_response(status_for(&e), &e.message())
        }
    }
}

fn status_for(err: &WfError) -> StatusCode {
    match err {
        WfError::BadRequest(_) => StatusCode::BAD_REQUEST,
        WfError::NotFound(_) => StatusCode::NOT_FOUND,
        WfError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        WfError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}
