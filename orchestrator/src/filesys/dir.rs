//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::WfError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), WfError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Create the directory with explicit permission bits
    pub async fn create_with_mode(&self, mode: u32) -> Result<(), WfError> {
        self.create().await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, std::fs::Permissions::from_mode(mode)).await?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(())
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), WfError> {
        if self.exists().await {
            fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }

    /// List files in the directory
    pub async fn list_files(&self) -> Result<Vec<PathBuf>, WfError> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }

        files.sort();
        Ok(files)
    }

    /// Every file below the directory, as paths relative to it
    pub async fn walk_files(&self) -> Result<Vec<PathBuf>, WfError> {
        let mut files = Vec::new();
        let mut pending = vec![self.path.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.path) {
                    files.push(relative.to_path_buf());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }
}

/// Copy a file or a directory tree
pub async fn copy_recursive(src: &Path, dest: &Path) -> Result<(), WfError> {
    let metadata = fs::metadata(src).await?;
    if metadata.is_file() {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(src, dest).await?;
        return Ok(());
    }
    let mut pending = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to).await?;
        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

/// Apply permission bits to a path, recursing into directories
pub async fn chmod_recursive(path: &Path, mode: u32) -> Result<(), WfError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut pending = vec![path.to_path_buf()];
        while let Some(current) = pending.pop() {
            let metadata = fs::metadata(&current).await?;
            fs::set_permissions(&current, std::fs::Permissions::from_mode(mode)).await?;
            if metadata.is_dir() {
                let mut entries = fs::read_dir(&current).await?;
                while let Some(entry) = entries.next_entry().await? {
                    pending.push(entry.path());
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// Rename, falling back to copy and delete across filesystems
pub async fn move_path(src: &Path, dest: &Path) -> Result<(), WfError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    match fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_recursive(src, dest).await?;
            if fs::metadata(src).await?.is_dir() {
                fs::remove_dir_all(src).await?;
            } else {
                fs::remove_file(src).await?;
            }
            Ok(())
        }
    }
}
