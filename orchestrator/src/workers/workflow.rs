//! Workflow reconcile pool

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::info;

use super::{join_pool, process_queue};
use crate::controller::Controller;

/// Workflow worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Workflows reconciled concurrently
    pub workers: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { workers: 32 }
    }
}

/// Run the workflow reconcile pool until shutdown
pub async fn run(
    options: &Options,
    controller: Arc<Controller>,
    shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Workflow worker starting with {} workers...", options.workers);

    let handles = (0..options.workers.max(1))
        .map(|_| {
            let controller = controller.clone();
            tokio::spawn(async move {
                let queue = controller.queue().clone();
                process_queue("workflow", queue, 0, |key: String| {
                    let controller = controller.clone();
                    async move { controller.reconcile(&key).await }
                })
                .await;
            })
        })
        .collect();

    shutdown_signal.await;
    info!("Workflow worker shutting down...");
    controller.queue().shut_down();
    join_pool("workflow", handles).await;
}
