//! Git repository checkouts through the `git` CLI

use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use tokio::process::Command;
use tracing::{debug, info};
use workflow_api::{Artifact, GitArtifact};

use super::{not_implemented, ArtifactDriver, ByteStream};
use crate::errors::WfError;
use crate::filesys::file::File;

pub struct GitDriver {
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_private_key: Option<String>,
    pub insecure_ignore_host_key: bool,
    pub disable_submodules: bool,
}

fn git_location(artifact: &Artifact) -> Result<&GitArtifact, WfError> {
    artifact
        .location
        .git
        .as_ref()
        .ok_or_else(|| WfError::BadRequest(format!("artifact {} is not a git artifact", artifact.name)))
}

/// `git clone` arguments for a checkout into `dest`
pub fn clone_args(git: &GitArtifact, dest: &Path) -> Vec<String> {
    let mut args = vec!["clone".to_string()];
    if let Some(depth) = git.depth.filter(|d| *d > 0) {
        args.push(format!("--depth={}", depth));
    }
    if git.single_branch {
        args.push("--single-branch".to_string());
    }
    if !git.branch.is_empty() {
        args.push("--branch".to_string());
        args.push(git.branch.clone());
    }
    args.push(git.repo.clone());
    args.push(dest.to_string_lossy().into_owned());
    args
}

impl GitDriver {
    /// Extra `-c` settings and environment for authenticated commands
    fn auth(&self, key_file: Option<&Path>) -> (Vec<String>, Vec<(String, String)>) {
        let mut config = Vec::new();
        let mut env = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];
        if self.username.is_some() || self.password.is_some() {
            let token = base64::engine::general_purpose::STANDARD.encode(format!(
                "{}:{}",
                self.username.as_deref().unwrap_or(""),
                self.password.as_deref().unwrap_or("")
            ));
            config.push("-c".to_string());
            config.push(format!("http.extraHeader=Authorization: Basic {}", token));
        }
        if let Some(key) = key_file {
            let mut ssh = format!("ssh -i {} -o IdentitiesOnly=yes", key.display());
            if self.insecure_ignore_host_key {
                ssh.push_str(" -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null");
            }
            env.push(("GIT_SSH_COMMAND".to_string(), ssh));
        }
        (config, env)
    }

    async fn git(
        &self,
        dir: Option<&Path>,
        args: &[String],
        key_file: Option<&Path>,
    ) -> Result<(), WfError> {
        let (config, env) = self.auth(key_file);
        let mut command = Command::new("git");
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        command.args(&config).args(args).envs(env);
        debug!("git {}", args.join(" "));
        let output = command
            .output()
            .await
            .map_err(|e| WfError::Internal(format!("failed to run git: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WfError::Internal(format!(
                "git {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactDriver for GitDriver {
    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<(), WfError> {
        let git = git_location(artifact)?;
        info!("Cloning {} into {:?}", git.repo, path);

        let key_dir = tempfile::tempdir()?;
        let key_file = match &self.ssh_private_key {
            Some(key) => {
                let key_path = key_dir.path().join("id");
                let file = File::new(&key_path);
                file.write_string(&format!("{}\n", key.trim_end())).await?;
                file.set_mode(0o600).await?;
                Some(key_path)
            }
            None => None,
        };
        let key_file = key_file.as_deref();

        self.git(None, &clone_args(git, path), key_file).await?;
        if !git.fetch.is_empty() {
            let mut args = vec!["fetch".to_string(), "origin".to_string()];
            args.extend(git.fetch.iter().cloned());
            self.git(Some(path), &args, key_file).await?;
        }
        if !git.revision.is_empty() {
            let args = vec!["checkout".to_string(), git.revision.clone()];
            self.git(Some(path), &args, key_file).await?;
        }
        if !self.disable_submodules {
            let args: Vec<String> = ["submodule", "update", "--init", "--recursive", "--force"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            self.git(Some(path), &args, key_file).await?;
        }
        Ok(())
    }

    async fn open_stream(&self, _artifact: &Artifact) -> Result<ByteStream, WfError> {
        Err(not_implemented("git", "open stream"))
    }

    async fn save(&self, _path: &Path, _artifact: &Artifact) -> Result<(), WfError> {
        Err(WfError::BadRequest("git output artifacts unsupported".to_string()))
    }

    async fn save_stream(&self, _stream: ByteStream, _artifact: &Artifact) -> Result<(), WfError> {
        Err(WfError::BadRequest("git output artifacts unsupported".to_string()))
    }

    async fn delete(&self, _artifact: &Artifact) -> Result<(), WfError> {
        Err(not_implemented("git", "delete"))
    }

    async fn list_objects(&self, _artifact: &Artifact) -> Result<Vec<String>, WfError> {
        Err(not_implemented("git", "list objects"))
    }

    async fn is_directory(&self, _artifact: &Artifact) -> Result<bool, WfError> {
        Ok(true)
    }
}
