//! Background workers of the controller
//!
//! Every worker takes its options, what it operates on, and a shutdown
//! signal. Periodic workers also take a `sleep_fn` so tests can drive them.

pub mod archive_gc;
pub mod informers;
pub mod offload_gc;
pub mod pod_cleanup;
pub mod retention;
pub mod ttl;
pub mod workflow;

use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::controller::workqueue::WorkQueue;
use crate::errors::WfError;

/// Feed keys from `queue` to `process` until the queue shuts down
///
/// `Ok(Some(delay))` requeues the key after `delay`. Transient errors are
/// retried with the queue's rate limit; other errors are retried up to
/// `max_retries` times.
pub(crate) async fn process_queue<K, P, Fut>(name: &'static str, queue: WorkQueue<K>, max_retries: u32, process: P)
where
    K: Clone + Eq + Hash + Send + Display,
    P: Fn(K) -> Fut,
    Fut: Future<Output = Result<Option<Duration>, WfError>>,
{
    while let Some(key) = queue.get().await {
        match process(key.clone()).await {
            Ok(requeue) => {
                queue.forget(&key);
                if let Some(delay) = requeue {
                    queue.add_after(key.clone(), delay);
                }
            }
            Err(e) if e.is_transient() || queue.num_requeues(&key) < max_retries => {
                warn!(worker = name, key = %key, "processing failed, retrying: {}", e);
                queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                error!(worker = name, key = %key, "processing failed: {}", e);
                queue.forget(&key);
            }
        }
        queue.done(&key);
    }
}

/// Wait for the tasks of a pool, logging any that panicked
pub(crate) async fn join_pool(name: &'static str, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(worker = name, "worker task failed: {}", e);
        }
    }
}
