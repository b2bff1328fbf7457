//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::WfError;
use crate::server::handlers::{authorize_webhook, event_handler, health_handler};
use crate::server::state::ServerState;

/// Routes of the webhook ingress
pub fn router(state: Arc<ServerState>) -> Router {
    let events = Router::new()
        .route("/api/v1/events/{namespace}/{discriminator}", post(event_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), authorize_webhook));

    Router::new()
        .route("/healthz", get(health_handler))
        .merge(events)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), WfError>>, WfError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting webhook server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| WfError::Internal(format!("failed to bind {}: {}", addr, e)))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| WfError::Internal(format!("webhook server failed: {}", e)))
    });

    Ok(handle)
}
