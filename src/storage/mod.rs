//! Filesystem primitives shared by every store
//!
//! The only guarantees relied on are whole-file atomic rename and directory
//! listing. Every write lands in a temporary file next to its target and is
//! renamed into place, so readers observe either the old or the new content.

pub mod lock;

pub use lock::{LockGuard, SharedLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Atomically replace `path` with `data`.
pub async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "path has no parent"))?;
    tokio::fs::create_dir_all(dir).await?;

    let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if written.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    written
}

/// Serialize `value` as YAML and write it atomically.
pub async fn write_yaml<T: Serialize>(path: &Path, value: &T) -> crate::Result<()> {
    let yaml = serde_yaml::to_string(value)?;
    write_atomic(path, yaml.as_bytes()).await?;
    tracing::debug!(path = %path.display(), "wrote document");
    Ok(())
}

/// Read a file, mapping "not found" to `None`.
pub async fn read_optional(path: &Path) -> std::io::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read and parse one YAML entity file. `Ok(None)` when the file is absent.
pub async fn read_yaml<T: DeserializeOwned>(path: &Path) -> crate::Result<Option<T>> {
    match read_optional(path).await? {
        Some(content) => Ok(Some(serde_yaml::from_str(&content)?)),
        None => Ok(None),
    }
}

/// Remove a file, returning whether it existed.
pub async fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// List the `*.yaml` files of a directory in file-name order.
///
/// A missing directory lists as empty; temporary files are skipped.
pub async fn list_yaml_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let hidden = file_name(&path).starts_with('.');
        if !hidden && path.extension().and_then(|e| e.to_str()) == Some("yaml") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// File name of a path as a string slice ("" when not UTF-8)
pub fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}
