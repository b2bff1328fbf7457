//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::app::env::{ControllerEnv, ExecutorEnv};
use crate::artifacts::plugin::SocketWait;
use crate::artifacts::volume::DEFAULT_VOLUME_ROOT;
use crate::storage::layout::{ExecutorLayout, VarRunArgo};
use crate::storage::settings::Settings;
use crate::utils::CooldownOptions;
use crate::workers::{archive_gc, informers, offload_gc, pod_cleanup, retention, ttl, workflow};

/// Options of the `controller` command
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Contents of the controller config file
    pub settings: Settings,

    /// Environment tunables
    pub env: ControllerEnv,

    /// Background worker options
    pub workers: WorkerOptions,

    /// Enable the webhook ingress server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            settings: Settings::default(),
            env: ControllerEnv::default(),
            workers: WorkerOptions::default(),
            enable_server: true,
            server: ServerOptions::default(),
        }
    }
}

impl ControllerOptions {
    /// Options derived from the config file and the environment
    pub fn new(settings: Settings, env: ControllerEnv) -> Self {
        let workers = WorkerOptions::from_settings(&settings, &env);
        let server = ServerOptions {
            host: settings.server.host.clone(),
            port: settings.server.port,
        };
        Self {
            lifecycle: LifecycleOptions::default(),
            enable_server: settings.server.enabled,
            settings,
            env,
            workers,
            server,
        }
    }
}

/// Lifecycle options for the controller
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Options for every controller worker
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Workflow reconcile pool
    pub workflow: workflow::Options,

    /// Pod cleanup pool
    pub pod_cleanup: pod_cleanup::Options,

    /// Informer relisting
    pub informers: informers::Options,

    /// TTL deletion of completed workflows
    pub ttl: ttl::Options,

    /// Retention policy enforcement
    pub retention: retention::Options,

    /// Reaping of unreferenced node-status offloads
    pub offload_gc: offload_gc::Options,

    /// Reaping of expired archived workflows
    pub archive_gc: archive_gc::Options,
}

impl WorkerOptions {
    pub fn from_settings(settings: &Settings, env: &ControllerEnv) -> Self {
        Self {
            workflow: workflow::Options {
                workers: settings.parallelism.max(1),
            },
            pod_cleanup: pod_cleanup::Options {
                workers: settings.pod_cleanup_workers.max(1),
            },
            informers: informers::Options::default(),
            ttl: ttl::Options::default(),
            retention: retention::Options {
                interval: env.retention_gc_period,
            },
            offload_gc: offload_gc::Options {
                interval: env.workflow_gc_period,
                ttl: env.offload_node_status_ttl,
            },
            archive_gc: archive_gc::Options {
                interval: env.archived_workflow_gc_period,
            },
        }
    }
}

/// Webhook server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2746,
        }
    }
}

/// Options of the `exec` commands
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Identity of the pod and container
    pub env: ExecutorEnv,

    /// Shared coordination volume
    pub var_run_argo: VarRunArgo,

    /// Artifact staging and main filesystem paths
    pub layout: ExecutorLayout,

    /// Backoff for control-plane writes
    pub backoff: CooldownOptions,

    /// Poll interval for container dependencies and exit codes
    pub dependency_poll_interval: Duration,

    /// Poll interval for signal files
    pub signal_poll_interval: Duration,

    /// Poll interval for the progress file
    pub progress_poll_interval: Duration,

    /// Root of mounted artifact volumes
    pub volume_root: PathBuf,

    /// Directory holding the plugin sockets
    pub plugin_socket_dir: PathBuf,

    /// How long to wait for a plugin socket
    pub plugin_wait: SocketWait,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            env: ExecutorEnv::default(),
            var_run_argo: VarRunArgo::default(),
            layout: ExecutorLayout::default(),
            backoff: CooldownOptions::default(),
            dependency_poll_interval: Duration::from_secs(1),
            signal_poll_interval: Duration::from_secs(2),
            progress_poll_interval: Duration::from_secs(3),
            volume_root: PathBuf::from(DEFAULT_VOLUME_ROOT),
            plugin_socket_dir: PathBuf::from(workflow_api::common::ARTIFACT_PLUGIN_SOCKET_DIR),
            plugin_wait: SocketWait::default(),
        }
    }
}

impl ExecutorOptions {
    pub fn from_env() -> Self {
        Self {
            env: ExecutorEnv::from_env(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_options_follow_settings() {
        let mut settings = Settings::default();
        settings.parallelism = 3;
        settings.server.port = 9000;
        let mut env = ControllerEnv::default();
        env.retention_gc_period = Duration::from_secs(5);
        let options = ControllerOptions::new(settings, env);
        assert_eq!(options.workers.workflow.workers, 3);
        assert_eq!(options.workers.retention.interval, Duration::from_secs(5));
        assert_eq!(options.server.port, 9000);
        assert_eq!(options.lifecycle.max_shutdown_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_executor_defaults() {
        let options = ExecutorOptions::default();
        assert_eq!(options.dependency_poll_interval, Duration::from_secs(1));
        assert_eq!(options.signal_poll_interval, Duration::from_secs(2));
        assert_eq!(options.backoff.max_attempts, 5);
    }
}
