//! Deletion of completed workflows whose TTL has expired

use std::future::Future;
use std::pin::Pin;

use tracing::info;

use super::process_queue;
use crate::controller::ttl::TtlCollector;

/// TTL worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Retries for failed deletions
    pub max_retries: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Run the TTL worker until shutdown
pub async fn run(
    options: &Options,
    collector: TtlCollector,
    shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("TTL worker starting...");
    let queue = collector.queue().clone();
    let worker = process_queue("ttl", queue.clone(), options.max_retries, |key: String| {
        let collector = collector.clone();
        async move { collector.process(&key).await.map(|_| None) }
    });
    let stop = async move {
        shutdown_signal.await;
        info!("TTL worker shutting down...");
        queue.shut_down();
    };
    tokio::join!(worker, stop);
}
