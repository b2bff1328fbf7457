//! Reaping of node-status offloads no workflow refers to

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::controller::Controller;

/// Offload GC worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between passes
    pub interval: Duration,

    /// Minimum age of a collectable offload
    pub ttl: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Run the offload GC worker
pub async fn run<S, F>(
    options: &Options,
    controller: Arc<Controller>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Offload GC worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Offload GC worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        match controller.collect_offloads(options.ttl).await {
            Ok(deleted) => debug!("Offload GC deleted {} node status versions", deleted),
            Err(e) => error!("Offload GC failed: {}", e),
        }
    }
}
