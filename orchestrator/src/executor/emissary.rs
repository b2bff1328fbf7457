//! `emissary` role: PID 1 of every main container
//!
//! Runs the user command in its own process group, tees its output when the
//! wait container needs it, relays signals written to the `signal` file and
//! always leaves an `exitcode` file behind. The `main` container also copies
//! its output parameters and artifacts onto the shared volume.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use workflow_api::common::MAIN_CONTAINER_NAME;
use workflow_api::Template;

use super::load_template;
use crate::app::options::ExecutorOptions;
use crate::errors::WfError;
use crate::filesys::archive::tar_gz;
use crate::filesys::file::File;
use crate::storage::layout::{is_under, VarRunArgo};
use crate::utils::parse_duration;

/// Exit code reported for a process killed by a signal
pub const SIGNALED_EXIT_CODE: i32 = 137;

/// Where a supervised process's output is copied to
#[derive(Debug, Clone)]
pub struct Tee {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub combined: PathBuf,
}

impl Tee {
    pub fn for_container(var_run_argo: &VarRunArgo, container: &str) -> Self {
        Self {
            stdout: var_run_argo.stdout_file(container).path().to_path_buf(),
            stderr: var_run_argo.stderr_file(container).path().to_path_buf(),
            combined: var_run_argo.combined_file(container).path().to_path_buf(),
        }
    }
}

/// Run the emissary; the returned code is also written to the `exitcode` file
pub async fn run(options: &ExecutorOptions, argv: &[String]) -> i32 {
    let container = options.env.container_name.clone();
    let code = match execute(options, argv).await {
        Ok(code) => code,
        Err(e) => {
            error!("emissary failed for container {}: {}", container, e);
            e.exit_code()
        }
    };
    let exitcode = options.var_run_argo.exitcode_file(&container);
    if let Err(e) = exitcode.write_string(&code.to_string()).await {
        error!("failed to write exit code of container {}: {}", container, e);
    }
    code
}

async fn execute(options: &ExecutorOptions, argv: &[String]) -> Result<i32, WfError> {
    let var_run_argo = &options.var_run_argo;
    let container = options.env.container_name.as_str();
    let argv = match argv.first().map(String::as_str) {
        Some("--") => &argv[1..],
        _ => argv,
    };
    if argv.is_empty() {
        return Err(WfError::BadRequest("no command to run".to_string()));
    }

    var_run_argo.ctr_dir(container).create_with_mode(0o700).await?;
    let template = load_template(options).await?;

    wait_for_dependencies(options, &template, container).await?;

    if options.env.debug_pause_before {
        wait_for_file(&var_run_argo.pause_before_file(container), options.dependency_poll_interval).await;
    }

    let tee = needs_capture(options, &template).then(|| Tee::for_container(var_run_argo, container));
    let (attempts, backoff) = retry_policy(&template)?;
    let signal_file = var_run_argo.signal_file(container);

    let mut code = 0;
    for attempt in 1..=attempts {
        code = supervise(argv, &signal_file, options.signal_poll_interval, tee.as_ref()).await?;
        if code == 0 || attempt == attempts {
            break;
        }
        warn!(
            "container {} exited with code {} (attempt {}/{}), retrying",
            container, code, attempt, attempts
        );
        tokio::time::sleep(backoff).await;
    }

    if options.env.debug_pause_after {
        wait_for_file(&var_run_argo.pause_after_file(container), options.dependency_poll_interval).await;
    }

    // a failed copy surfaces in the wait container, the exit code stays the user's
    if container == MAIN_CONTAINER_NAME {
        if let Err(e) = copy_outputs(var_run_argo, &template).await {
            error!("failed to copy outputs of container {}: {}", container, e);
        }
    }
    Ok(code)
}

fn needs_capture(options: &ExecutorOptions, template: &Template) -> bool {
    let archive_logs = template
        .archive_location
        .as_ref()
        .and_then(|l| l.archive_logs)
        .unwrap_or(false);
    options.env.include_script_output || template.captures_result() || archive_logs
}

/// Attempts and pause between them from the container-set retry strategy
fn retry_policy(template: &Template) -> Result<(u32, Duration), WfError> {
    let strategy = match template.container_set.as_ref().and_then(|s| s.retry_strategy.as_ref()) {
        Some(strategy) => strategy,
        None => return Ok((1, Duration::ZERO)),
    };
    let retries = match strategy.retries.trim() {
        "" => 0,
        raw => raw
            .parse::<u32>()
            .map_err(|_| WfError::BadRequest(format!("invalid container set retries '{}'", raw)))?,
    };
    let backoff = match strategy.duration.as_deref() {
        Some(raw) if !raw.is_empty() => parse_duration(raw)?,
        _ => Duration::ZERO,
    };
    Ok((retries + 1, backoff))
}

/// Block until every container-set dependency of `container` exited 0
async fn wait_for_dependencies(options: &ExecutorOptions, template: &Template, container: &str) -> Result<(), WfError> {
    let dependencies = template
        .container_set
        .as_ref()
        .and_then(|set| set.container(container))
        .map(|node| node.dependencies.clone())
        .unwrap_or_default();

    for dependency in dependencies {
        let exitcode = options.var_run_argo.exitcode_file(&dependency);
        loop {
            if let Some(code) = exitcode.read_int().await? {
                if code != 0 {
                    return Err(WfError::DependencyFailed(format!(
                        "dependency {} exited with non-zero code: {}",
                        dependency, code
                    )));
                }
                debug!("dependency {} of {} succeeded", dependency, container);
                break;
            }
            tokio::time::sleep(options.dependency_poll_interval).await;
        }
    }
    Ok(())
}

async fn wait_for_file(file: &File, interval: Duration) {
    info!("paused until {:?} exists", file.path());
    while !file.exists().await {
        tokio::time::sleep(interval).await;
    }
}

/// Run `argv` in a new process group until it exits
///
/// Signals received by this process and values written to `signal_file` are
/// delivered to the whole group. Returns the exit code, or 137 when the
/// process was killed by a signal.
pub async fn supervise(
    argv: &[String],
    signal_file: &File,
    poll_interval: Duration,
    tee: Option<&Tee>,
) -> Result<i32, WfError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| WfError::BadRequest("no command to run".to_string()))?;

    let mut command = Command::new(program);
    command.args(args).process_group(0);
    if tee.is_some() {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    }
    let mut child = command
        .spawn()
        .map_err(|e| WfError::BadRequest(format!("failed to start {}: {}", program, e)))?;
    let pid = child
        .id()
        .ok_or_else(|| WfError::Internal(format!("{} exited before it could be supervised", program)))?;
    let pgid = Pid::from_raw(pid as i32);
    info!("started {} as process group {}", program, pid);

    let mut copiers = Vec::new();
    if let Some(tee) = tee {
        let combined = Arc::new(Mutex::new(tokio::fs::File::create(&tee.combined).await?));
        if let Some(stdout) = child.stdout.take() {
            copiers.push(spawn_copier(stdout, tokio::io::stdout(), tee.stdout.clone(), combined.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            copiers.push(spawn_copier(stderr, tokio::io::stderr(), tee.stderr.clone(), combined));
        }
    }

    let forwarders = forward_signals(pgid);
    let mut ticker = tokio::time::interval(poll_interval);
    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            _ = ticker.tick() => relay_signal_file(signal_file, pgid).await,
        }
    };
    for forwarder in forwarders {
        forwarder.abort();
    }
    for copier in copiers {
        match copier.await {
            Ok(Err(e)) => warn!("failed to capture output: {}", e),
            Err(e) => warn!("output capture task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    let code = exit_code(status);
    info!("{} exited with code {}", program, code);
    Ok(code)
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(SIGNALED_EXIT_CODE)
}

fn spawn_copier<R, W>(
    mut reader: R,
    mut forward: W,
    own: PathBuf,
    combined: Arc<Mutex<tokio::fs::File>>,
) -> JoinHandle<Result<(), WfError>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut own = tokio::fs::File::create(&own).await?;
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            forward.write_all(&buf[..n]).await?;
            own.write_all(&buf[..n]).await?;
            combined.lock().await.write_all(&buf[..n]).await?;
        }
        forward.flush().await?;
        own.flush().await?;
        combined.lock().await.flush().await?;
        Ok(())
    })
}

/// Signals kept by the emissary: child reaping, urgent socket data, and
/// faults that only make sense for the process raising them
const NOT_FORWARDED: [Signal; 10] = [
    Signal::SIGCHLD,
    Signal::SIGURG,
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGTRAP,
    Signal::SIGSYS,
];

/// Signals relayed from the emissary to the supervised process group
pub fn forwarded_signals() -> impl Iterator<Item = Signal> {
    Signal::iterator().filter(|sig| !NOT_FORWARDED.contains(sig))
}

fn forward_signals(pgid: Pid) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for sig in forwarded_signals() {
        let mut stream = match signal(SignalKind::from_raw(sig as i32)) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("cannot forward {}: {}", sig, e);
                continue;
            }
        };
        handles.push(tokio::spawn(async move {
            while stream.recv().await.is_some() {
                deliver(pgid, sig);
            }
        }));
    }
    handles
}

/// Deliver and consume a signal number written to `signal_file`
pub async fn relay_signal_file(signal_file: &File, pgid: Pid) {
    let value = match signal_file.read_int().await {
        Ok(Some(value)) => value,
        Ok(None) => return,
        Err(e) => {
            warn!("unreadable signal file {:?}: {}", signal_file.path(), e);
            let _ = signal_file.delete().await;
            return;
        }
    };
    if let Err(e) = signal_file.delete().await {
        warn!("failed to remove signal file {:?}: {}", signal_file.path(), e);
    }
    if value <= 0 {
        return;
    }
    match Signal::try_from(value) {
        Ok(sig) => deliver(pgid, sig),
        Err(e) => warn!("ignoring unknown signal {}: {}", value, e),
    }
}

fn deliver(pgid: Pid, sig: Signal) {
    info!("delivering {} to process group {}", sig, pgid);
    if let Err(e) = killpg(pgid, sig) {
        warn!("failed to deliver {} to process group {}: {}", sig, pgid, e);
    }
}

/// Copy output parameter files and pack output artifacts onto the shared volume
///
/// Sources on a user volume are left in place for the wait container.
pub async fn copy_outputs(var_run_argo: &VarRunArgo, template: &Template) -> Result<(), WfError> {
    let mounts = template.volume_mounts();
    let on_volume = |path: &str| mounts.iter().any(|m| is_under(path, &m.mount_path));

    for param in &template.outputs.parameters {
        let path = match param.value_from.as_ref().map(|v| v.path.as_str()) {
            Some(path) if !path.is_empty() => path,
            _ => continue,
        };
        if on_volume(path) {
            debug!("output parameter {} is on a volume, leaving it to wait", param.name);
            continue;
        }
        if !Path::new(path).is_file() {
            warn!("output parameter {} source {} is missing, skipping", param.name, path);
            continue;
        }
        let dest = var_run_argo.output_parameter_file(path);
        if let Some(parent) = dest.path().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(path, dest.path()).await?;
        debug!("copied output parameter {} from {}", param.name, path);
    }

    for artifact in &template.outputs.artifacts {
        if artifact.path.is_empty() {
            continue;
        }
        if on_volume(&artifact.path) {
            debug!("output artifact {} is on a volume, leaving it to wait", artifact.name);
            continue;
        }
        if tokio::fs::metadata(&artifact.path).await.is_err() {
            warn!("output artifact {} source {} is missing, skipping", artifact.name, artifact.path);
            continue;
        }
        let level = artifact
            .archive_strategy()
            .tar
            .and_then(|t| t.compression_level);
        let dest = var_run_argo.output_artifact_file(&artifact.path);
        tar_gz(Path::new(&artifact.path), dest.path(), level).await?;
        debug!("packed output artifact {} to {:?}", artifact.name, dest.path());
    }
    Ok(())
}
