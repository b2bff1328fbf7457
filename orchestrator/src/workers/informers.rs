//! Relisting of the controller's informers

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::info;

use crate::controller::Controller;

/// Informer worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between relists
    pub resync_period: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(10),
        }
    }
}

/// Run every informer of `controller` until shutdown
pub async fn run<S, F>(
    options: &Options,
    controller: Arc<Controller>,
    sleep_fn: S,
    shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Informer worker starting...");

    let shutdown = shutdown_signal.shared();
    let signal = || -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(shutdown.clone()) };
    let period = options.resync_period;
    tokio::join!(
        controller.pod_informer().run(period, &sleep_fn, signal()),
        controller.task_result_informer().run(period, &sleep_fn, signal()),
        controller.task_set_informer().run(period, &sleep_fn, signal()),
        controller.workflow_informer().run(period, &sleep_fn, signal()),
    );

    info!("Informer worker shutting down...");
}
