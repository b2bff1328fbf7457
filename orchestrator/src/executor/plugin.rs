//! Artifact plugin roles
//!
//! `artifact-plugin-init` copies this binary onto the shared volume so that a
//! plugin image without it can start through `exec artifact-plugin-sidecar`.
//! The sidecar role supervises the plugin server and forwards values written
//! to its `signal` file, the way the emissary does for main containers.

use tracing::{error, info};

use super::emissary::supervise;
use crate::app::options::ExecutorOptions;
use crate::errors::WfError;
use crate::filesys::file::File;

/// Copy the running executable to `dest` with mode 0755
pub async fn copy_executor_binary(dest: &File) -> Result<(), WfError> {
    let source = std::env::current_exe()?;
    copy_binary(&File::new(source), dest).await
}

async fn copy_binary(source: &File, dest: &File) -> Result<(), WfError> {
    let bytes = source.read_bytes().await?;
    dest.write_atomic(&bytes).await?;
    dest.set_mode(0o755).await?;
    info!("copied executor binary to {:?}", dest.path());
    Ok(())
}

/// Run the plugin server until it exits; returns its exit code
pub async fn run_sidecar(options: &ExecutorOptions, argv: &[String]) -> Result<i32, WfError> {
    let argv: Vec<String> = match argv.first().map(String::as_str) {
        Some("--") => argv[1..].to_vec(),
        _ => argv.to_vec(),
    };
    let container = &options.env.container_name;
    info!("starting artifact plugin sidecar {}: {:?}", container, argv);
    let signal_file = options.var_run_argo.signal_file(container);
    let code = supervise(&argv, &signal_file, options.signal_poll_interval, None).await?;
    if code != 0 {
        error!("artifact plugin sidecar {} exited with code {}", container, code);
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_copy_binary_sets_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let source = File::new(tmp.path().join("bin"));
        source.write_string("#!/bin/sh\n").await.unwrap();
        let dest = File::new(tmp.path().join("shared/argoflow"));
        copy_binary(&source, &dest).await.unwrap();

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dest.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(dest.read_string().await.unwrap(), "#!/bin/sh\n");
    }

    #[tokio::test]
    async fn test_sidecar_stops_on_signal_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut options = testing::options(tmp.path());
        options.env.container_name = "artifact-plugin-blob".to_string();
        let signal = options.var_run_argo.signal_file("artifact-plugin-blob");
        signal.write_string("15").await.unwrap();

        let argv = vec!["--".to_string(), "sleep".to_string(), "30".to_string()];
        let code = tokio::time::timeout(Duration::from_secs(5), run_sidecar(&options, &argv))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(code, 0);
    }
}
