//! `init` role: write the template, stage files and load input artifacts

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use workflow_api::Artifact;

use super::WorkflowExecutor;
use crate::errors::WfError;
use crate::filesys::archive;
use crate::filesys::dir::{chmod_recursive, move_path};
use crate::telemetry::attributes::{
    ATTRIB_ARTIFACT_ARCHIVE, ATTRIB_ARTIFACT_PATH, ATTRIB_NODE_ID, ATTRIB_POD_NAME, ATTRIB_WORKFLOW_NAME,
};
use crate::telemetry::spans::{LOAD_ARTIFACT, LOAD_ARTIFACTS, RUN_INIT_CONTAINER, UNARCHIVE_ARTIFACT};
use crate::telemetry::TraceSpan;

/// Mode given to artifacts served by plugins when none is declared
const PLUGIN_ARTIFACT_MODE: u32 = 0o666;

impl WorkflowExecutor {
    pub async fn init(&self) -> Result<(), WfError> {
        let env = &self.options.env;
        let root = self.tracer().start(
            RUN_INIT_CONTAINER,
            None,
            &[
                (ATTRIB_WORKFLOW_NAME, env.workflow_name.as_str()),
                (ATTRIB_POD_NAME, env.pod_name.as_str()),
                (ATTRIB_NODE_ID, env.node_id.as_str()),
            ],
        );
        self.options
            .var_run_argo
            .template_file()
            .write_string(&serde_json::to_string(&self.template)?)
            .await?;
        self.stage_files().await?;
        self.load_artifacts(&root).await
    }

    /// Load every declared input artifact into place
    pub async fn load_artifacts(&self, parent: &TraceSpan) -> Result<(), WfError> {
        let span = self.tracer().start(LOAD_ARTIFACTS, Some(parent), &[]);
        for artifact in &self.template.inputs.artifacts {
            self.load_artifact(artifact, &span).await?;
        }
        Ok(())
    }

    async fn load_artifact(&self, artifact: &Artifact, parent: &TraceSpan) -> Result<(), WfError> {
        let span = self
            .tracer()
            .start(LOAD_ARTIFACT, Some(parent), &[(ATTRIB_ARTIFACT_PATH, artifact.path.as_str())]);

        if !artifact.has_location() {
            if artifact.optional {
                warn!("ignoring optional input artifact {} without a location", artifact.name);
                return Ok(());
            }
            return Err(WfError::BadRequest(format!(
                "required artifact '{}' not supplied",
                artifact.name
            )));
        }

        let dest = self.input_destination(artifact);
        let temp = temp_path(&dest);
        let driver = self.factory().new_driver(artifact).await?;
        match driver.load(artifact, &temp).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() && artifact.optional => {
                warn!("ignoring missing optional input artifact {}: {}", artifact.name, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        info!("loaded input artifact {} to {:?}", artifact.name, temp);

        self.unarchive(artifact, &temp, &dest, &span).await?;

        let mode = artifact
            .mode
            .or_else(|| artifact.plugin_name().map(|_| PLUGIN_ARTIFACT_MODE));
        if let Some(mode) = mode {
            chmod_recursive(&dest, mode).await?;
        }
        Ok(())
    }

    /// Where an input artifact lands before the main container starts
    ///
    /// Paths on a user volume are written straight into the main filesystem;
    /// everything else goes to the staging dir the pod mounts at the path.
    pub fn input_destination(&self, artifact: &Artifact) -> PathBuf {
        if !artifact.path.is_empty() && self.is_on_volume_mount(&artifact.path) {
            self.options.layout.main_fs_path(&artifact.path)
        } else {
            self.options.layout.input_artifact_path(&artifact.name)
        }
    }

    async fn unarchive(&self, artifact: &Artifact, temp: &Path, dest: &Path, parent: &TraceSpan) -> Result<(), WfError> {
        let is_file = tokio::fs::metadata(temp).await?.is_file();
        if is_file && archive::is_tar_gz(temp)? {
            let _span = self
                .tracer()
                .start(UNARCHIVE_ARTIFACT, Some(parent), &[(ATTRIB_ARTIFACT_ARCHIVE, "tar.gz")]);
            archive::untar(temp, dest).await?;
            tokio::fs::remove_file(temp).await?;
        } else if is_file && artifact.archive.as_ref().is_some_and(|a| a.zip.is_some()) {
            let _span = self
                .tracer()
                .start(UNARCHIVE_ARTIFACT, Some(parent), &[(ATTRIB_ARTIFACT_ARCHIVE, "zip")]);
            archive::unzip(temp, dest).await?;
            tokio::fs::remove_file(temp).await?;
        } else {
            move_path(temp, dest).await?;
        }
        Ok(())
    }
}

fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use crate::cluster::InMemoryCluster;
    use crate::filesys::archive::tar_gz;
    use crate::filesys::file::File;
    use std::sync::Arc;
    use workflow_api::Template;

    fn template(artifacts: &str) -> Template {
        serde_json::from_str(&format!(
            r#"{{"name":"t","container":{{"image":"busybox",
                "volumeMounts":[{{"name":"work","mountPath":"/work"}}]}},
                "inputs":{{"artifacts":{}}}}}"#,
            artifacts
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_raw_artifact_loaded_to_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = testing::executor(
            tmp.path(),
            template(r#"[{"name":"msg","path":"/tmp/msg","raw":{"data":"hi"},"mode":420}]"#),
            Arc::new(InMemoryCluster::new()),
        );
        executor.init().await.unwrap();
        let loaded = executor.options.layout.input_artifact_path("msg");
        assert_eq!(File::new(&loaded).read_string().await.unwrap(), "hi");
        assert!(executor.options.var_run_argo.template_file().exists().await);
    }

    #[tokio::test]
    async fn test_volume_mount_target_and_tarball() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src/data.txt");
        File::new(&src).write_string("payload").await.unwrap();
        let tarball = tmp.path().join("mnt/store/data.tgz");
        tar_gz(&src, &tarball, None).await.unwrap();

        let executor = testing::executor(
            tmp.path(),
            template(r#"[{"name":"d","path":"/work/data.txt","volume":{"name":"store","path":"data.tgz"}}]"#),
            Arc::new(InMemoryCluster::new()),
        );
        executor.init().await.unwrap();
        let dest = executor.options.layout.main_fs_path("/work/data.txt");
        assert_eq!(File::new(&dest).read_string().await.unwrap(), "payload");
        assert!(!File::new(dest.with_file_name("data.txt.tmp")).exists().await);
    }

    #[tokio::test]
    async fn test_optional_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = testing::executor(
            tmp.path(),
            template(
                r#"[{"name":"none","path":"/a","optional":true},
                    {"name":"gone","path":"/b","optional":true,"volume":{"name":"store","path":"missing"}}]"#,
            ),
            Arc::new(InMemoryCluster::new()),
        );
        executor.init().await.unwrap();

        let required = testing::executor(
            tmp.path(),
            template(r#"[{"name":"req","path":"/a"}]"#),
            Arc::new(InMemoryCluster::new()),
        );
        let err = required.init().await.unwrap_err();
        assert!(err.to_string().contains("required artifact 'req' not supplied"));
    }
}
