//! Pod cleanup pool

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::info;

use super::{join_pool, process_queue};
use crate::controller::pod_cleanup::{PodCleaner, PodCleanupKey};

/// Failed cleanup actions are retried this many times
const MAX_RETRIES: u32 = 5;

/// Pod cleanup worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Cleanup actions run concurrently
    pub workers: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// Run the pod cleanup pool until shutdown
pub async fn run(
    options: &Options,
    cleaner: PodCleaner,
    shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Pod cleanup worker starting with {} workers...", options.workers);
    let cleaner = Arc::new(cleaner);

    let handles = (0..options.workers.max(1))
        .map(|_| {
            let cleaner = cleaner.clone();
            tokio::spawn(async move {
                let queue = cleaner.queue().clone();
                process_queue("pod_cleanup", queue, MAX_RETRIES, |key: PodCleanupKey| {
                    let cleaner = cleaner.clone();
                    async move { cleaner.process(&key).await.map(|_| None) }
                })
                .await;
            })
        })
        .collect();

    shutdown_signal.await;
    info!("Pod cleanup worker shutting down...");
    cleaner.queue().shut_down();
    join_pool("pod_cleanup", handles).await;
}
