//! Artifacts on a volume mounted at `/mnt/<name>`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use workflow_api::Artifact;

use super::{stream_file, write_stream, ArtifactDriver, ByteStream};
use crate::errors::WfError;
use crate::filesys::dir::{copy_recursive, Dir};

pub const DEFAULT_VOLUME_ROOT: &str = "/mnt";

pub struct VolumeDriver {
    root: PathBuf,
}

impl VolumeDriver {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// `<root>/<name>/<subPath>/<path>`
    pub fn location(&self, artifact: &Artifact) -> Result<PathBuf, WfError> {
        let volume = artifact.location.volume.as_ref().ok_or_else(|| {
            WfError::BadRequest(format!("artifact {} is not a volume artifact", artifact.name))
        })?;
        if volume.name.is_empty() {
            return Err(WfError::BadRequest(format!(
                "volume artifact {} has no volume name",
                artifact.name
            )));
        }
        let mut path = self.root.join(&volume.name);
        for part in [artifact.sub_path.as_str(), volume.path.as_str()] {
            let part = part.trim_start_matches('/');
            if part.split('/').any(|segment| segment == "..") {
                return Err(WfError::BadRequest(format!(
                    "volume artifact {} escapes its volume: {}",
                    artifact.name, part
                )));
            }
            if !part.is_empty() {
                path = path.join(part);
            }
        }
        Ok(path)
    }
}

async fn remove_existing(path: &Path) -> Result<(), WfError> {
    match fs::metadata(path).await {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path).await?,
        Ok(_) => fs::remove_file(path).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[async_trait]
impl ArtifactDriver for VolumeDriver {
    async fn load(&self, artifact: &Artifact, path: &Path) -> Result<(), WfError> {
        let src = self.location(artifact)?;
        if fs::metadata(&src).await.is_err() {
            return Err(WfError::NotFound(format!("volume artifact {} not found at {:?}", artifact.name, src)));
        }
        copy_recursive(&src, path).await
    }

    async fn open_stream(&self, artifact: &Artifact) -> Result<ByteStream, WfError> {
        stream_file(&self.location(artifact)?).await
    }

    async fn save(&self, path: &Path, artifact: &Artifact) -> Result<(), WfError> {
        let dest = self.location(artifact)?;
        remove_existing(&dest).await?;
        copy_recursive(path, &dest).await
    }

    async fn save_stream(&self, stream: ByteStream, artifact: &Artifact) -> Result<(), WfError> {
        write_stream(stream, &self.location(artifact)?).await?;
        Ok(())
    }

    async fn delete(&self, artifact: &Artifact) -> Result<(), WfError> {
        remove_existing(&self.location(artifact)?).await
    }

    async fn list_objects(&self, artifact: &Artifact) -> Result<Vec<String>, WfError> {
        let base = self.location(artifact)?;
        let key = artifact
            .location
            .volume
            .as_ref()
            .map(|v| v.path.trim_end_matches('/').to_string())
            .unwrap_or_default();
        let prefix = |relative: &Path| -> String {
            let relative = relative.to_string_lossy();
            if key.is_empty() {
                relative.into_owned()
            } else {
                format!("{}/{}", key, relative)
            }
        };
        match fs::metadata(&base).await {
            Ok(m) if m.is_dir() => Ok(Dir::new(&base)
                .walk_files()
                .await?
                .iter()
                .map(|p| prefix(p))
                .collect()),
            Ok(_) => Ok(vec![key]),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_directory(&self, artifact: &Artifact) -> Result<bool, WfError> {
        Ok(fs::metadata(self.location(artifact)?).await?.is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_api::artifact::{ArtifactLocation, VolumeArtifact};

    fn artifact(path: &str) -> Artifact {
        Artifact {
            name: "out".to_string(),
            location: ArtifactLocation {
                volume: Some(VolumeArtifact {
                    name: "store".to_string(),
                    path: path.to_string(),
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_save_then_load_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = VolumeDriver::new(&tmp.path().join("mnt"));
        let src = tmp.path().join("src.bin");
        std::fs::write(&src, [0u8, 159, 146, 150, 10]).unwrap();

        let a = artifact("wf/pod/out.tgz");
        driver.save(&src, &a).await.unwrap();
        assert_eq!(
            driver.location(&a).unwrap(),
            tmp.path().join("mnt/store/wf/pod/out.tgz")
        );

        let dest = tmp.path().join("loaded.bin");
        driver.load(&a, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), std::fs::read(&src).unwrap());
        assert!(!driver.is_directory(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_delete_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = VolumeDriver::new(tmp.path());
        let dir = tmp.path().join("store/logs");
        std::fs::create_dir_all(dir.join("a")).unwrap();
        std::fs::write(dir.join("a/1.log"), "1").unwrap();
        std::fs::write(dir.join("2.log"), "2").unwrap();

        let a = artifact("logs");
        assert_eq!(
            driver.list_objects(&a).await.unwrap(),
            vec!["logs/2.log".to_string(), "logs/a/1.log".to_string()]
        );
        assert!(driver.is_directory(&a).await.unwrap());
        driver.delete(&a).await.unwrap();
        assert!(driver.list_objects(&a).await.unwrap().is_empty());
        assert!(driver
            .load(&a, &tmp.path().join("x"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_rejects_parent_segments() {
        let driver = VolumeDriver::new(Path::new("/mnt"));
        assert!(driver.location(&artifact("../etc/passwd")).is_err());
    }
}
