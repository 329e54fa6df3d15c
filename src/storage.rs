//! Persistence for vector store snapshots
//!
//! Each [`VectorStore`](crate::vector_store::VectorStore) serializes its
//! entries to one JSON document (`vectorstore_<name>.json` under the data
//! dir). The backend only moves whole documents; it never parses them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Where snapshot documents are kept
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Replace the snapshot at `path`. Readers see either the previous
    /// document or the new one, never a torn write.
    async fn save(&self, path: &Path, content: &str) -> Result<()>;

    /// `None` when no snapshot has been written yet
    async fn load(&self, path: &Path) -> Result<Option<String>>;
}

/// Snapshots as files on local disk
#[derive(Debug, Default)]
pub struct FileSystemStorage;

impl FileSystemStorage {
    pub fn new() -> Self {
        Self
    }
}

/// `vectorstore_memory.json` -> `vectorstore_memory.json.tmp`
fn staging_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create data directory {parent:?}"))?;
        }

        let staging = staging_path(path);
        let mut file = fs::File::create(&staging)
            .await
            .with_context(|| format!("Failed to create {staging:?}"))?;
        file.write_all(content.as_bytes())
            .await
            .with_context(|| format!("Failed to write {staging:?}"))?;
        file.sync_all()
            .await
            .with_context(|| format!("Failed to sync {staging:?}"))?;
        drop(file);

        fs::rename(&staging, path)
            .await
            .with_context(|| format!("Failed to move snapshot into place at {path:?}"))?;

        tracing::trace!(path = ?path, bytes = content.len(), "Snapshot written");
        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read snapshot {path:?}")),
        }
    }
}
