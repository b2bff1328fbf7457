//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{ControllerOptions, LifecycleOptions};
use crate::clock;
use crate::cluster::SharedClient;
use crate::controller::Controller;
use crate::errors::WfError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::telemetry;
use crate::webhook::{LoggingDispatcher, Verifier};
use crate::workers::{archive_gc, informers, offload_gc, pod_cleanup, retention, ttl, workflow};

/// Run the workflow controller until `shutdown_signal` resolves
pub async fn run(
    options: ControllerOptions,
    client: SharedClient,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), WfError> {
    info!("Initializing workflow controller...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, client, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start controller: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &ControllerOptions,
    client: SharedClient,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<Controller>, WfError> {
    telemetry::validate()?;

    let controller = Controller::new(
        client.clone(),
        options.settings.clone(),
        options.env.clone(),
        clock::system(),
    );
    info!("Listing workflows, pods and task results...");
    controller.sync_informers().await?;

    init_informer_worker(
        options.workers.informers.clone(),
        controller.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_workflow_worker(
        options.workers.workflow.clone(),
        controller.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_pod_cleanup_worker(
        options.workers.pod_cleanup.clone(),
        controller.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_ttl_worker(
        options.workers.ttl.clone(),
        controller.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    if options.settings.retention_policy.is_some() {
        init_retention_worker(
            options.workers.retention.clone(),
            controller.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if options.settings.node_status_offload.enabled {
        init_offload_gc_worker(
            options.workers.offload_gc.clone(),
            controller.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if options.settings.archive.enabled && options.settings.archive.ttl.is_some() {
        init_archive_gc_worker(
            options.workers.archive_gc.clone(),
            controller.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if options.enable_server {
        init_webhook_server(options, client, shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(controller)
}

fn init_informer_worker(
    options: informers::Options,
    controller: Arc<Controller>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), WfError> {
    info!("Initializing informer worker...");

    let handle = tokio::spawn(async move {
        informers::run(
            &options,
            controller,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_worker_handle("informers", handle)
}

fn init_workflow_worker(
    options: workflow::Options,
    controller: Arc<Controller>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), WfError> {
    info!("Initializing workflow worker...");

    let handle = tokio::spawn(async move {
        workflow::run(
            &options,
            controller,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_worker_handle("workflow", handle)
}

fn init_pod_cleanup_worker(
    options: pod_cleanup::Options,
    controller: Arc<Controller>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), WfError> {
    info!("Initializing pod cleanup worker...");

    let cleaner = controller.pod_cleaner().clone();
    let handle = tokio::spawn(async move {
        pod_cleanup::run(
            &options,
            cleaner,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_worker_handle("pod_cleanup", handle)
}

fn init_ttl_worker(
    options: ttl::Options,
    controller: Arc<Controller>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), WfError> {
    info!("Initializing TTL worker...");

    let collector = controller.ttl().clone();
    let handle = tokio::spawn(async move {
        ttl::run(
            &options,
            collector,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_worker_handle("ttl", handle)
}

fn init_retention_worker(
    options: retention::Options,
    controller: Arc<Controller>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), WfError> {
    info!("Initializing retention worker...");

    let handle = tokio::spawn(async move {
        retention::run(
            &options,
            controller,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_worker_handle("retention", handle)
}

fn init_offload_gc_worker(
    options: offload_gc::Options,
    controller: Arc<Controller>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), WfError> {
    info!("Initializing offload GC worker...");

    let handle = tokio::spawn(async move {
        offload_gc::run(
            &options,
            controller,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_worker_handle("offload_gc", handle)
}

fn init_archive_gc_worker(
    options: archive_gc::Options,
    controller: Arc<Controller>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), WfError> {
    info!("Initializing archive GC worker...");

    let handle = tokio::spawn(async move {
        archive_gc::run(
            &options,
            controller,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_worker_handle("archive_gc", handle)
}

async fn init_webhook_server(
    options: &ControllerOptions,
    client: SharedClient,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), WfError> {
    info!("Initializing webhook server...");

    let verifier = Verifier::new(&options.settings.webhook.clients, client);
    let state = ServerState::new(Arc::new(verifier), Arc::new(LoggingDispatcher));

    let server_handle = serve(&options.server, Arc::new(state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    worker_handles: Vec<(&'static str, JoinHandle<()>)>,
    server_handle: Option<JoinHandle<Result<(), WfError>>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            worker_handles: Vec::new(),
            server_handle: None,
        }
    }

    pub fn with_worker_handle(
        &mut self,
        name: &'static str,
        handle: JoinHandle<()>,
    ) -> Result<(), WfError> {
        if self.worker_handles.iter().any(|(existing, _)| *existing == name) {
            return Err(WfError::ShutdownError(format!("{}_handle already set", name)));
        }
        self.worker_handles.push((name, handle));
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), WfError>>,
    ) -> Result<(), WfError> {
        if self.server_handle.is_some() {
            return Err(WfError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), WfError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), WfError> {
        info!("Shutting down workflow controller...");

        // 1. Workers, in the order they were started
        for (name, handle) in self.worker_handles.drain(..) {
            handle
                .await
                .map_err(|e| WfError::ShutdownError(format!("{} worker: {}", name, e)))?;
        }

        // 2. Webhook server
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| WfError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}

/// Resolve on SIGTERM, SIGINT or Ctrl+C
pub async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, waiting for Ctrl+C only");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let mut options = ControllerOptions::default();
        options.enable_server = false;
        options.lifecycle.max_shutdown_delay = Duration::from_secs(10);
        let client: SharedClient = Arc::new(InMemoryCluster::new());

        run(options, client, tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_handle_rejected() {
        let (tx, _rx) = broadcast::channel(1);
        let mut manager = ShutdownManager::new(tx, LifecycleOptions::default());
        manager.with_worker_handle("ttl", tokio::spawn(async {})).unwrap();
        let err = manager
            .with_worker_handle("ttl", tokio::spawn(async {}))
            .unwrap_err();
        assert!(matches!(err, WfError::ShutdownError(_)));
        manager.shutdown().await.unwrap();
    }
}
