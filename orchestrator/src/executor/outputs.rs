//! Collecting outputs in the `wait` role: script result, parameters,
//! artifacts and logs

use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use workflow_api::artifact::ArtifactLocation;
use workflow_api::common::MAIN_CONTAINER_NAME;
use workflow_api::{Artifact, Outputs, Parameter};

use super::WorkflowExecutor;
use crate::errors::WfError;
use crate::expr::{self, jsonpath, Env};
use crate::filesys::archive::{tar_gz, untar, zip_path};
use crate::filesys::file::File;
use crate::telemetry::attributes::{ATTRIB_ARTIFACT_ARCHIVE, ATTRIB_ARTIFACT_PATH};
use crate::telemetry::spans::{ARCHIVE_ARTIFACT, SAVE_ARTIFACT, SAVE_ARTIFACTS};
use crate::telemetry::TraceSpan;

/// Largest script result kept, counted from the end of stdout
pub const MAX_RESULT_BYTES: usize = 256 * 1024;

/// Strip a single trailing newline
pub fn trim_newline(text: &str) -> &str {
    text.strip_suffix('\n').unwrap_or(text)
}

/// The last `max` bytes of `text`, cut on a character boundary
pub fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Where a packed artifact goes, and the key suffix for its strategy
enum Packing {
    Tar,
    None,
    Zip,
}

impl Packing {
    fn of(artifact: &Artifact) -> Self {
        let strategy = artifact.archive_strategy();
        if strategy.none.is_some() {
            Packing::None
        } else if strategy.zip.is_some() {
            Packing::Zip
        } else {
            Packing::Tar
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Packing::Tar => "tar",
            Packing::None => "none",
            Packing::Zip => "zip",
        }
    }

    fn key_suffix(&self) -> &'static str {
        match self {
            Packing::Tar => ".tgz",
            Packing::None => "",
            Packing::Zip => ".zip",
        }
    }
}

impl WorkflowExecutor {
    /// Stdout of the main container becomes `outputs.result`
    pub async fn capture_script_result(&self, outputs: &mut Outputs) -> Result<(), WfError> {
        if !self.template.captures_result() && !self.options.env.include_script_output {
            return Ok(());
        }
        let container = self
            .template
            .main_container_names()
            .into_iter()
            .next()
            .unwrap_or_else(|| MAIN_CONTAINER_NAME.to_string());
        let stdout = self.options.var_run_argo.stdout_file(&container);
        let text = match stdout.read_string_opt().await? {
            Some(text) => text,
            None => {
                warn!("no stdout captured for container {}", container);
                return Ok(());
            }
        };
        let result = tail(trim_newline(&text), MAX_RESULT_BYTES);
        debug!("captured {} bytes of script result", result.len());
        outputs.result = Some(result.to_string());
        Ok(())
    }

    /// Resolve every declared output parameter
    pub async fn save_parameters(&self, outputs: &mut Outputs) {
        for declared in &self.template.outputs.parameters {
            match self.resolve_parameter(declared, outputs).await {
                Ok(param) => outputs.parameters.push(param),
                Err(e) => self.record_error(e),
            }
        }
    }

    async fn resolve_parameter(&self, declared: &Parameter, outputs: &Outputs) -> Result<Parameter, WfError> {
        let mut param = declared.clone();
        let value_from = match &declared.value_from {
            Some(value_from) => value_from,
            None => return Ok(param),
        };
        if value_from.supplied.is_some() {
            return Ok(param);
        }

        if !value_from.path.is_empty() {
            let file = if self.is_on_volume_mount(&value_from.path) {
                File::new(self.options.layout.main_fs_path(&value_from.path))
            } else {
                self.options.var_run_argo.output_parameter_file(&value_from.path)
            };
            match file.read_string_opt().await? {
                Some(text) => param.value = Some(trim_newline(&text).to_string()),
                None => match &value_from.default {
                    Some(default) => {
                        info!("output parameter {} uses its default", declared.name);
                        param.value = Some(default.clone());
                    }
                    None => {
                        return Err(WfError::NotFound(format!(
                            "output parameter {} file {} does not exist",
                            declared.name, value_from.path
                        )))
                    }
                },
            }
        } else if !value_from.expression.is_empty() {
            let env = self.output_env(outputs);
            let value = expr::eval(&value_from.expression, &env)?;
            param.value = Some(jsonpath::render(&value));
        } else if param.value.is_none() {
            param.value = value_from.default.clone();
        }
        Ok(param)
    }

    fn output_env(&self, outputs: &Outputs) -> Env {
        let mut env = Env::new();
        if let Some(result) = &outputs.result {
            env.insert("outputs.result", Value::String(result.clone()));
        }
        if let Some(code) = &outputs.exit_code {
            env.insert("exitCode", Value::String(code.clone()));
        }
        for p in &outputs.parameters {
            if let Some(v) = &p.value {
                env.insert(&format!("outputs.parameters.{}", p.name), Value::String(v.clone()));
            }
        }
        for p in &self.template.inputs.parameters {
            if let Some(v) = &p.value {
                env.insert(&format!("inputs.parameters.{}", p.name), Value::String(v.clone()));
            }
        }
        env
    }

    /// Upload every declared output artifact; failures are recorded, not returned
    pub async fn save_artifacts(&self, parent: &TraceSpan, outputs: &mut Outputs) {
        let span = self.tracer().start(SAVE_ARTIFACTS, Some(parent), &[]);
        for artifact in &self.template.outputs.artifacts {
            match self.save_artifact(artifact, &span).await {
                Ok(Some(saved)) => outputs.artifacts.push(saved),
                Ok(None) => {}
                Err(e) => self.record_error(e),
            }
        }
    }

    async fn save_artifact(&self, artifact: &Artifact, parent: &TraceSpan) -> Result<Option<Artifact>, WfError> {
        let span = self
            .tracer()
            .start(SAVE_ARTIFACT, Some(parent), &[(ATTRIB_ARTIFACT_PATH, artifact.path.as_str())]);
        if artifact.path.is_empty() {
            return Err(WfError::BadRequest(format!("output artifact {} has no path", artifact.name)));
        }

        let packed = self.options.var_run_argo.output_artifact_file(&artifact.path);
        let local = self.options.layout.main_fs_path(&artifact.path);
        let source = if !self.is_on_volume_mount(&artifact.path) && packed.exists().await {
            Source::Packed(packed.path().to_path_buf())
        } else if tokio::fs::metadata(&local).await.is_ok() {
            Source::Local(local)
        } else if artifact.optional {
            warn!("optional output artifact {} not found, skipping", artifact.name);
            return Ok(None);
        } else {
            return Err(WfError::NotFound(format!(
                "output artifact {} path {} does not exist",
                artifact.name, artifact.path
            )));
        };

        let packing = Packing::of(artifact);
        let mut saved = artifact.clone();
        saved.location = self.output_location(artifact, &packing)?;

        let work = TempDir::new()?;
        let upload = {
            let _span = self
                .tracer()
                .start(ARCHIVE_ARTIFACT, Some(&span), &[(ATTRIB_ARTIFACT_ARCHIVE, packing.name())]);
            self.pack(artifact, &source, &packing, work.path()).await?
        };

        let driver = self.factory().new_driver(&saved).await?;
        driver.save(&upload, &saved).await?;
        info!("saved output artifact {} from {:?}", artifact.name, upload);
        Ok(Some(saved))
    }

    /// The artifact's own location, or the default repository with a generated key
    fn output_location(&self, artifact: &Artifact, packing: &Packing) -> Result<ArtifactLocation, WfError> {
        if artifact.has_location() {
            return Ok(artifact.location.clone());
        }
        let mut location = self.repository().ok_or_else(|| {
            WfError::BadRequest(format!(
                "output artifact {} has no location and no artifact repository is configured",
                artifact.name
            ))
        })?;
        let key = format!(
            "{}/{}/{}{}",
            self.options.env.workflow_name,
            self.options.env.pod_name,
            artifact.name,
            packing.key_suffix()
        );
        location.set_key(&key).map_err(WfError::BadRequest)?;
        location.archive_logs = None;
        Ok(location)
    }

    /// The template's archive location when it names one, else the default repository
    fn repository(&self) -> Option<ArtifactLocation> {
        self.template
            .archive_location
            .as_ref()
            .filter(|l| l.has_location())
            .or(self.default_repository())
            .cloned()
    }

    async fn pack(&self, artifact: &Artifact, source: &Source, packing: &Packing, work: &Path) -> Result<PathBuf, WfError> {
        let name = Path::new(&artifact.path)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| artifact.name.clone().into());
        match (packing, source) {
            (Packing::Tar, Source::Packed(tgz)) => Ok(tgz.clone()),
            (Packing::Tar, Source::Local(path)) => {
                let dest = work.join("artifact.tgz");
                let level = artifact.archive_strategy().tar.and_then(|t| t.compression_level);
                tar_gz(path, &dest, level).await?;
                Ok(dest)
            }
            (Packing::None, Source::Packed(tgz)) => {
                let dest = work.join(name);
                untar(tgz, &dest).await?;
                Ok(dest)
            }
            (Packing::None, Source::Local(path)) => Ok(path.clone()),
            (Packing::Zip, source) => {
                let content = match source {
                    Source::Packed(tgz) => {
                        let dest = work.join(name);
                        untar(tgz, &dest).await?;
                        dest
                    }
                    Source::Local(path) => path.clone(),
                };
                let dest = work.join("artifact.zip");
                zip_path(&content, &dest).await?;
                Ok(dest)
            }
        }
    }

    /// Upload the combined output of each main container as `<container>-logs`
    pub async fn save_logs(&self, outputs: &mut Outputs) {
        let enabled = self
            .template
            .archive_location
            .as_ref()
            .and_then(|l| l.archive_logs)
            .or_else(|| self.default_repository().and_then(|l| l.archive_logs))
            .unwrap_or(false);
        if !enabled {
            return;
        }
        for container in self.template.main_container_names() {
            match self.save_log(&container).await {
                Ok(Some(saved)) => outputs.artifacts.push(saved),
                Ok(None) => {}
                Err(e) => self.record_error(e),
            }
        }
    }

    async fn save_log(&self, container: &str) -> Result<Option<Artifact>, WfError> {
        let log = self.options.var_run_argo.combined_file(container);
        if !log.exists().await {
            warn!("no log captured for container {}", container);
            return Ok(None);
        }
        let mut location = self.repository().ok_or_else(|| {
            WfError::BadRequest("log archiving is enabled but no artifact repository is configured".to_string())
        })?;
        let key = format!(
            "{}/{}/{}.log",
            self.options.env.workflow_name, self.options.env.pod_name, container
        );
        location.set_key(&key).map_err(WfError::BadRequest)?;
        location.archive_logs = None;
        let artifact = Artifact {
            name: format!("{}-logs", container),
            location,
            ..Default::default()
        };
        let driver = self.factory().new_driver(&artifact).await?;
        driver.save(log.path(), &artifact).await?;
        info!("saved logs of container {}", container);
        Ok(Some(artifact))
    }
}

enum Source {
    /// Tarball written by the emissary
    Packed(PathBuf),
    /// Path read through the main container's filesystem
    Local(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::filesys::archive::read_single_entry;
    use std::sync::Arc;
    use workflow_api::Template;

    fn executor(root: &Path, template: &str) -> WorkflowExecutor {
        let template: Template = serde_json::from_str(template).unwrap();
        testing::executor(root, template, Arc::new(InMemoryCluster::new())).with_default_repository(Some(
            serde_json::from_value(serde_json::json!({"volume":{"name":"repo"}})).unwrap(),
        ))
    }

    #[test]
    fn test_trim_and_tail() {
        assert_eq!(trim_newline("a\n\n"), "a\n");
        assert_eq!(trim_newline("a"), "a");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("héllo", 4), "llo");
    }

    #[tokio::test]
    async fn test_script_result_and_expression_parameter() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = executor(
            tmp.path(),
            r#"{"name":"s","script":{"image":"python","source":"print(1)"},
                "inputs":{"parameters":[{"name":"n","value":"2"}]},
                "outputs":{"parameters":[
                    {"name":"doubled","valueFrom":{"expression":"asInt(outputs.result) * asInt(inputs.parameters.n)"}},
                    {"name":"fixed","value":"x"}]}}"#,
        );
        executor
            .options
            .var_run_argo
            .stdout_file("main")
            .write_string("21\n")
            .await
            .unwrap();

        let mut outputs = Outputs::default();
        executor.capture_script_result(&mut outputs).await.unwrap();
        assert_eq!(outputs.result.as_deref(), Some("21"));
        executor.save_parameters(&mut outputs).await;
        assert!(!executor.has_errors(), "{}", executor.error_message());
        assert_eq!(outputs.parameters[0].value.as_deref(), Some("42"));
        assert_eq!(outputs.parameters[1].value.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_path_parameter_default_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = executor(
            tmp.path(),
            r#"{"name":"c","container":{"image":"busybox"},
                "outputs":{"parameters":[
                    {"name":"found","valueFrom":{"path":"/tmp/found"}},
                    {"name":"defaulted","valueFrom":{"path":"/tmp/nope","default":"d"}},
                    {"name":"missing","valueFrom":{"path":"/tmp/gone"}}]}}"#,
        );
        executor
            .options
            .var_run_argo
            .output_parameter_file("/tmp/found")
            .write_string("value\n")
            .await
            .unwrap();

        let mut outputs = Outputs::default();
        executor.save_parameters(&mut outputs).await;
        assert_eq!(outputs.parameters.len(), 2);
        assert_eq!(outputs.parameters[0].value.as_deref(), Some("value"));
        assert_eq!(outputs.parameters[1].value.as_deref(), Some("d"));
        assert!(executor.error_message().contains("missing"));
    }

    #[tokio::test]
    async fn test_packed_artifact_uploaded_to_default_repository() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = executor(
            tmp.path(),
            r#"{"name":"c","container":{"image":"busybox"},
                "outputs":{"artifacts":[{"name":"out","path":"/tmp/artifact"},
                                        {"name":"opt","path":"/tmp/none","optional":true}]}}"#,
        );
        let src = tmp.path().join("src/artifact");
        File::new(&src).write_string("hello").await.unwrap();
        let packed = executor.options.var_run_argo.output_artifact_file("/tmp/artifact");
        tar_gz(&src, packed.path(), None).await.unwrap();

        let root = executor.tracer().start(crate::telemetry::spans::RUN_WAIT_CONTAINER, None, &[]);
        let mut outputs = Outputs::default();
        executor.save_artifacts(&root, &mut outputs).await;
        assert!(!executor.has_errors(), "{}", executor.error_message());
        assert_eq!(outputs.artifacts.len(), 1);
        assert_eq!(outputs.artifacts[0].location.key().as_deref(), Some("wf/wf-123/out.tgz"));

        let stored = tmp.path().join("mnt/repo/wf/wf-123/out.tgz");
        assert_eq!(read_single_entry(&stored).unwrap(), b"hello");
        assert_eq!(executor.tracer().violations(), 0);
    }

    #[tokio::test]
    async fn test_missing_required_artifact_is_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = executor(
            tmp.path(),
            r#"{"name":"c","container":{"image":"busybox"},
                "outputs":{"artifacts":[{"name":"a","path":"/tmp/a"},{"name":"b","path":"/tmp/b"}]}}"#,
        );
        let root = executor.tracer().start(crate::telemetry::spans::RUN_WAIT_CONTAINER, None, &[]);
        let mut outputs = Outputs::default();
        executor.save_artifacts(&root, &mut outputs).await;
        let message = executor.error_message();
        assert!(message.contains("output artifact a") && message.contains("; "));
    }

    #[tokio::test]
    async fn test_logs_archived() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = executor(
            tmp.path(),
            r#"{"name":"c","container":{"image":"busybox"},
                "archiveLocation":{"archiveLogs":true}}"#,
        );
        executor
            .options
            .var_run_argo
            .combined_file("main")
            .write_string("line\n")
            .await
            .unwrap();
        let mut outputs = Outputs::default();
        executor.save_logs(&mut outputs).await;
        assert_eq!(outputs.artifacts[0].name, "main-logs");
        let stored = tmp.path().join("mnt/repo/wf/wf-123/main.log");
        assert_eq!(tokio::fs::read_to_string(stored).await.unwrap(), "line\n");
    }
}
