//! Monitors that run beside the workload in the `wait` role

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use workflow_api::common::is_artifact_plugin_sidecar;
use workflow_api::NodeResult;

use super::WorkflowExecutor;
use crate::filesys::file::File;
use crate::telemetry::TraceSpan;

/// Message recorded when the deadline passes
pub const DEADLINE_MESSAGE: &str = "Step exceeded its deadline";

const SIGTERM: &str = "15";
const SIGKILL: &str = "9";

/// Parse `N/M` progress; `M` must be positive and `N` at most `M`
pub fn parse_progress(line: &str) -> Option<(u64, u64)> {
    let (n, m) = line.trim().split_once('/')?;
    let n: u64 = n.trim().parse().ok()?;
    let m: u64 = m.trim().parse().ok()?;
    (m > 0 && n <= m).then_some((n, m))
}

impl WorkflowExecutor {
    /// Time left until the pod deadline, if one is set
    pub fn time_to_deadline(&self, now: DateTime<Utc>) -> Option<Duration> {
        let raw = self.options.env.deadline.as_deref()?;
        match DateTime::parse_from_rfc3339(raw) {
            Ok(deadline) => Some((deadline.with_timezone(&Utc) - now).to_std().unwrap_or(Duration::ZERO)),
            Err(e) => {
                warn!("ignoring invalid deadline {}: {}", raw, e);
                None
            }
        }
    }

    /// Terminate the main containers once the deadline passes; never returns
    pub async fn monitor_deadline(&self) {
        let remaining = match self.time_to_deadline(Utc::now()) {
            Some(remaining) => remaining,
            None => return std::future::pending().await,
        };
        tokio::time::sleep(remaining).await;

        info!("deadline exceeded, terminating main containers");
        self.record_message(DEADLINE_MESSAGE);
        self.signal_main_containers(SIGTERM).await;
        tokio::time::sleep(self.options.env.termination_grace_period).await;
        self.signal_main_containers(SIGKILL).await;
        std::future::pending::<()>().await
    }

    async fn signal_main_containers(&self, signal: &str) {
        for container in self.template.main_container_names() {
            if is_artifact_plugin_sidecar(&container) {
                continue;
            }
            let file = self.options.var_run_argo.signal_file(&container);
            if let Err(e) = file.write_string(signal).await {
                warn!("failed to signal container {}: {}", container, e);
            }
        }
    }

    /// Report self-declared progress from the progress file; never returns
    pub async fn monitor_progress(&self, parent: &TraceSpan) {
        let path = match self.options.env.progress_file.as_deref() {
            Some(path) => path,
            None => return std::future::pending().await,
        };
        let file = File::new(self.options.layout.main_fs_path(path));
        let mut last = String::new();
        loop {
            tokio::time::sleep(self.options.progress_poll_interval).await;
            let text = match file.read_string_opt().await {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(e) => {
                    warn!("failed to read progress file: {}", e);
                    continue;
                }
            };
            let line = match text.lines().rev().find(|l| !l.trim().is_empty()) {
                Some(line) => line.trim(),
                None => continue,
            };
            let Some((n, m)) = parse_progress(line) else {
                continue;
            };
            let progress = format!("{}/{}", n, m);
            if progress == last {
                continue;
            }
            let result = NodeResult {
                progress: progress.clone(),
                ..Default::default()
            };
            match self.report_result(&result, parent).await {
                Ok(()) => last = progress,
                Err(e) => warn!("failed to report progress: {}", e),
            }
        }
    }
}
