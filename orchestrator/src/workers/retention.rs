//! Periodic enforcement of the retention policy

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::controller::Controller;

/// Retention worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between passes
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Run the retention worker
pub async fn run<S, F>(
    options: &Options,
    controller: Arc<Controller>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Retention worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Retention worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        match controller.enforce_retention().await {
            Ok(0) => debug!("Retention pass deleted nothing"),
            Ok(deleted) => info!("Retention pass deleted {} workflows", deleted),
            Err(e) => error!("Retention pass failed: {}", e),
        }
    }
}
