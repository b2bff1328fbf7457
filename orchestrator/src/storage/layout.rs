//! File layout of the shared coordination volume

use std::path::{Path, PathBuf};

use workflow_api::common::{
    EXECUTOR_ARTIFACT_BASE_DIR, EXECUTOR_RESOURCE_MANIFEST_PATH, EXECUTOR_SCRIPT_SOURCE_NAME,
    EXECUTOR_STAGING_DIR, MAIN_FILESYSTEM_DIR, VAR_RUN_ARGO_PATH,
};

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Paths under `/var/run/argo` shared by every container of a pod
///
/// ```text
/// template
/// ctr/<container>/{exitcode,signal,stdout,stderr,combined,before,after}
/// outputs/parameters/<path>
/// outputs/artifacts/<path>.tgz
/// ```
#[derive(Debug, Clone)]
pub struct VarRunArgo {
    pub base_dir: PathBuf,
}

impl VarRunArgo {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// JSON of the running template
    pub fn template_file(&self) -> File {
        File::new(self.base_dir.join("template"))
    }

    pub fn ctr_dir(&self, container: &str) -> Dir {
        Dir::new(self.base_dir.join("ctr").join(container))
    }

    pub fn exitcode_file(&self, container: &str) -> File {
        self.ctr_dir(container).file("exitcode")
    }

    pub fn signal_file(&self, container: &str) -> File {
        self.ctr_dir(container).file("signal")
    }

    pub fn stdout_file(&self, container: &str) -> File {
        self.ctr_dir(container).file("stdout")
    }

    pub fn stderr_file(&self, container: &str) -> File {
        self.ctr_dir(container).file("stderr")
    }

    pub fn combined_file(&self, container: &str) -> File {
        self.ctr_dir(container).file("combined")
    }

    /// Marker files released by a debugger when pausing is enabled
    pub fn pause_before_file(&self, container: &str) -> File {
        self.ctr_dir(container).file("before")
    }

    pub fn pause_after_file(&self, container: &str) -> File {
        self.ctr_dir(container).file("after")
    }

    /// Copy of an output parameter file, keyed by its path in the container
    pub fn output_parameter_file(&self, path: &str) -> File {
        File::new(self.base_dir.join("outputs/parameters").join(path.trim_start_matches('/')))
    }

    /// Tarball of an output artifact, keyed by its path in the container
    pub fn output_artifact_file(&self, path: &str) -> File {
        File::new(
            self.base_dir
                .join("outputs/artifacts")
                .join(format!("{}.tgz", path.trim_start_matches('/'))),
        )
    }

    /// Copy of the executor binary for plugin sidecars
    pub fn executor_binary(&self) -> File {
        File::new(self.base_dir.join("argoflow"))
    }
}

impl Default for VarRunArgo {
    fn default() -> Self {
        Self::new(VAR_RUN_ARGO_PATH)
    }
}

/// Paths the init and wait containers use
#[derive(Debug, Clone)]
pub struct ExecutorLayout {
    /// Staging directory for input artifacts
    pub artifact_base_dir: PathBuf,

    /// Mount point of the main container's filesystem
    pub main_fs_dir: PathBuf,

    /// Where the script source is staged
    pub staging_dir: PathBuf,

    /// Where a resource manifest is staged
    pub manifest_path: PathBuf,
}

impl ExecutorLayout {
    pub fn new(artifact_base_dir: impl Into<PathBuf>, main_fs_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact_base_dir: artifact_base_dir.into(),
            main_fs_dir: main_fs_dir.into(),
            staging_dir: PathBuf::from(EXECUTOR_STAGING_DIR),
            manifest_path: PathBuf::from(EXECUTOR_RESOURCE_MANIFEST_PATH),
        }
    }

    /// Layout rooted under `root`, for tests and local runs
    pub fn rooted(root: &Path) -> Self {
        Self {
            artifact_base_dir: root.join("inputs/artifacts"),
            main_fs_dir: root.join("mainctrfs"),
            staging_dir: root.join("staging"),
            manifest_path: root.join("manifest.yaml"),
        }
    }

    pub fn script_file(&self) -> File {
        File::new(self.staging_dir.join(EXECUTOR_SCRIPT_SOURCE_NAME))
    }

    pub fn manifest_file(&self) -> File {
        File::new(&self.manifest_path)
    }

    pub fn input_artifact_path(&self, name: &str) -> PathBuf {
        self.artifact_base_dir.join(name)
    }

    /// Path of a main-container file as seen from the wait container
    pub fn main_fs_path(&self, path: &str) -> PathBuf {
        self.main_fs_dir.join(path.trim_start_matches('/'))
    }
}

impl Default for ExecutorLayout {
    fn default() -> Self {
        Self::new(EXECUTOR_ARTIFACT_BASE_DIR, MAIN_FILESYSTEM_DIR)
    }
}

/// Whether `path` is `mount` or lies below it
pub fn is_under(path: &str, mount: &str) -> bool {
    let path = Path::new(path);
    let mount = Path::new(mount);
    path.starts_with(mount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_paths() {
        let layout = VarRunArgo::new("/var/run/argo");
        assert_eq!(
            layout.exitcode_file("main").path(),
            Path::new("/var/run/argo/ctr/main/exitcode")
        );
        assert_eq!(
            layout.output_parameter_file("/tmp/parameter").path(),
            Path::new("/var/run/argo/outputs/parameters/tmp/parameter")
        );
        assert_eq!(
            layout.output_artifact_file("/tmp/artifact").path(),
            Path::new("/var/run/argo/outputs/artifacts/tmp/artifact.tgz")
        );
    }

    #[test]
    fn test_is_under() {
        assert!(is_under("/work/out/file", "/work"));
        assert!(is_under("/work", "/work"));
        assert!(!is_under("/workspace/file", "/work"));
    }
}
