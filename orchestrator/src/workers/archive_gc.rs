//! Expiry of archived workflows

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::controller::Controller;

/// Archive GC worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between passes
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Run the archive GC worker
pub async fn run<S, F>(
    options: &Options,
    controller: Arc<Controller>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Archive GC worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Archive GC worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        match controller.collect_archives().await {
            Ok(0) => {}
            Ok(deleted) => info!("Archive GC deleted {} archived workflows", deleted),
            Err(e) => error!("Archive GC failed: {}", e),
        }
    }
}
