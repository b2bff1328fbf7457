//! Tar, gzip and zip handling for artifacts

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::errors::WfError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression level used when a tar strategy does not specify one
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Write `src` (file or directory) as a gzip-compressed tarball at `dest`
///
/// The tarball holds one top-level entry named after `src`.
pub async fn tar_gz(src: &Path, dest: &Path, level: Option<i32>) -> Result<(), WfError> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || tar_gz_blocking(&src, &dest, level))
        .await
        .map_err(|e| WfError::Internal(format!("archive task failed: {}", e)))?
}

fn tar_gz_blocking(src: &Path, dest: &Path, level: Option<i32>) -> Result<(), WfError> {
    let name = entry_name(src)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let level = match level {
        Some(l) if (0..=9).contains(&l) => Compression::new(l as u32),
        _ => Compression::new(DEFAULT_COMPRESSION_LEVEL),
    };
    let file = fs::File::create(dest)?;
    let encoder = GzEncoder::new(file, level);
    let mut builder = tar::Builder::new(encoder);
    if fs::metadata(src)?.is_dir() {
        builder.append_dir_all(&name, src)?;
    } else {
        builder.append_path_with_name(src, &name)?;
    }
    let encoder = builder.into_inner()?;
    encoder.finish()?.sync_all()?;
    Ok(())
}

/// Write `src` as a zip archive at `dest`
pub async fn zip_path(src: &Path, dest: &Path) -> Result<(), WfError> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || zip_blocking(&src, &dest))
        .await
        .map_err(|e| WfError::Internal(format!("archive task failed: {}", e)))?
}

fn zip_blocking(src: &Path, dest: &Path) -> Result<(), WfError> {
    let name = entry_name(src)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = zip::ZipWriter::new(fs::File::create(dest)?);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut pending = vec![(src.to_path_buf(), PathBuf::from(&name))];
    while let Some((path, entry)) = pending.pop() {
        let entry_str = entry.to_string_lossy().replace('\\', "/");
        if fs::metadata(&path)?.is_dir() {
            writer.add_directory(format!("{}/", entry_str), options).map_err(zip_err)?;
            for child in fs::read_dir(&path)? {
                let child = child?;
                pending.push((child.path(), entry.join(child.file_name())));
            }
        } else {
            writer.start_file(entry_str, options).map_err(zip_err)?;
            let mut contents = Vec::new();
            fs::File::open(&path)?.read_to_end(&mut contents)?;
            writer.write_all(&contents)?;
        }
    }
    writer.finish().map_err(zip_err)?;
    Ok(())
}

/// Whether the file starts with the gzip magic and holds a tar stream
pub fn is_tar_gz(path: &Path) -> Result<bool, WfError> {
    let mut file = fs::File::open(path)?;
    let mut magic = [0u8; 2];
    if file.read(&mut magic)? < 2 || magic != GZIP_MAGIC {
        return Ok(false);
    }
    let mut decoder = GzDecoder::new(fs::File::open(path)?);
    let mut header = [0u8; 512];
    let mut read = 0;
    while read < header.len() {
        match decoder.read(&mut header[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(_) => return Ok(false),
        }
    }
    // ustar magic at offset 257
    Ok(read == header.len() && &header[257..262] == b"ustar")
}

/// Extract a tarball to `dest`
///
/// A tarball holding a single top-level entry is extracted as `dest` itself,
/// otherwise `dest` becomes a directory of the entries.
pub async fn untar(src: &Path, dest: &Path) -> Result<(), WfError> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || untar_blocking(&src, &dest))
        .await
        .map_err(|e| WfError::Internal(format!("unarchive task failed: {}", e)))?
}

fn untar_blocking(src: &Path, dest: &Path) -> Result<(), WfError> {
    let staging = staging_dir(dest);
    fs::create_dir_all(&staging)?;
    let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(src)?));
    archive.set_preserve_permissions(true);
    archive.unpack(&staging)?;
    promote(&staging, dest)
}

/// Extract a zip archive to `dest` with the same single-entry rule as `untar`
pub async fn unzip(src: &Path, dest: &Path) -> Result<(), WfError> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let staging = staging_dir(&dest);
        fs::create_dir_all(&staging)?;
        let mut archive = zip::ZipArchive::new(fs::File::open(&src)?).map_err(zip_err)?;
        archive.extract(&staging).map_err(zip_err)?;
        promote(&staging, &dest)
    })
    .await
    .map_err(|e| WfError::Internal(format!("unarchive task failed: {}", e)))?
}

/// Decompress a plain gzip file
pub async fn gunzip(src: &Path, dest: &Path) -> Result<(), WfError> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut decoder = GzDecoder::new(fs::File::open(&src)?);
        let mut out = fs::File::create(&dest)?;
        std::io::copy(&mut decoder, &mut out)?;
        Ok(())
    })
    .await
    .map_err(|e| WfError::Internal(format!("unarchive task failed: {}", e)))?
}

fn promote(staging: &Path, dest: &Path) -> Result<(), WfError> {
    let entries: Vec<PathBuf> = fs::read_dir(staging)?
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_existing(dest)?;
    if entries.len() == 1 {
        fs::rename(&entries[0], dest)?;
        fs::remove_dir_all(staging)?;
    } else {
        fs::rename(staging, dest)?;
    }
    Ok(())
}

fn remove_existing(path: &Path) -> Result<(), WfError> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(_) => {}
    }
    Ok(())
}

fn staging_dir(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".extract");
    dest.with_file_name(name)
}

fn entry_name(src: &Path) -> Result<String, WfError> {
    src.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| WfError::BadRequest(format!("cannot archive {:?}: no file name", src)))
}

fn zip_err(e: zip::result::ZipError) -> WfError {
    WfError::Internal(format!("zip: {}", e))
}

/// Read the single file held by a tarball, used by tests and small outputs
pub fn read_single_entry(src: &Path) -> Result<Vec<u8>, WfError> {
    let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(src)?));
    let mut entries = archive.entries()?;
    match entries.next() {
        Some(entry) => {
            let mut entry = entry?;
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            Ok(contents)
        }
        None => Err(WfError::NotFound(format!("{:?} is an empty tarball", src))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tar_single_file() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("artifact");
        fs::write(&src, "hello").unwrap();
        let tgz = tmp.path().join("out/artifact.tgz");
        tar_gz(&src, &tgz, None).await.unwrap();

        assert!(is_tar_gz(&tgz).unwrap());
        assert_eq!(read_single_entry(&tgz).unwrap(), b"hello");

        let restored = tmp.path().join("restored");
        untar(&tgz, &restored).await.unwrap();
        assert_eq!(fs::read_to_string(&restored).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_tar_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("dir");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a"), "a").unwrap();
        fs::write(src.join("sub/b"), "b").unwrap();
        let tgz = tmp.path().join("dir.tgz");
        tar_gz(&src, &tgz, Some(1)).await.unwrap();

        let restored = tmp.path().join("copy");
        untar(&tgz, &restored).await.unwrap();
        assert_eq!(fs::read_to_string(restored.join("sub/b")).unwrap(), "b");
    }

    #[tokio::test]
    async fn test_zip_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("data.txt");
        fs::write(&src, "zipped").unwrap();
        let archive = tmp.path().join("data.zip");
        zip_path(&src, &archive).await.unwrap();
        assert!(!is_tar_gz(&archive).unwrap());

        let restored = tmp.path().join("restored.txt");
        unzip(&archive, &restored).await.unwrap();
        assert_eq!(fs::read_to_string(&restored).unwrap(), "zipped");
    }

    #[test]
    fn test_plain_file_is_not_tarball() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("plain");
        fs::write(&src, "not an archive").unwrap();
        assert!(!is_tar_gz(&src).unwrap());
    }
}
