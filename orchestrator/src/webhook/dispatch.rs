//! Hand-off of verified events

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::errors::WfError;

/// An event accepted by the ingress
#[derive(Debug, Clone)]
pub struct Event {
    pub namespace: String,

    /// Free-form routing key taken from the request path
    pub discriminator: String,

    pub payload: Value,

    /// Service account whose token authorized the event
    pub service_account: String,

    /// `Authorization` header injected for the service account
    pub authorization: String,
}

/// Receives events once their source has been verified
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn dispatch(&self, event: Event) -> Result<(), WfError>;
}

/// Logs and accepts every event
#[derive(Debug, Clone, Default)]
pub struct LoggingDispatcher;

#[async_trait]
impl EventDispatcher for LoggingDispatcher {
    async fn dispatch(&self, event: Event) -> Result<(), WfError> {
        info!(
            namespace = %event.namespace,
            discriminator = %event.discriminator,
            service_account = %event.service_account,
            "received event"
        );
        Ok(())
    }
}
