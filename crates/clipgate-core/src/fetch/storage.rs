//! Local-directory storage backend.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::retry::ErrorKind;

use super::{FetchError, StorageUploader};

/// Moves finished files under a root directory and hands out `file://` URLs.
#[derive(Debug, Clone)]
pub struct LocalDirStorage {
    root: PathBuf,
}

impl LocalDirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destination for `key`; keys may only name paths below the root.
    fn destination(&self, key: &str) -> Result<PathBuf, FetchError> {
        let rel = Path::new(key);
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(FetchError::Permanent(format!("invalid storage key {key:?}")));
        }
        Ok(self.root.join(rel))
    }
}

fn io_error(what: &str, path: &Path, e: std::io::Error) -> FetchError {
    FetchError::transient(ErrorKind::Unknown, format!("{} {}: {}", what, path.display(), e))
}

#[async_trait]
impl StorageUploader for LocalDirStorage {
    async fn upload(&self, local: &Path, key: &str) -> Result<String, FetchError> {
        let dest = self.destination(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create", parent, e))?;
        }

        // Rename fails across filesystems; fall back to copy + remove.
        if tokio::fs::rename(local, &dest).await.is_err() {
            tokio::fs::copy(local, &dest)
                .await
                .map_err(|e| io_error("copy to", &dest, e))?;
            if let Err(e) = tokio::fs::remove_file(local).await {
                tracing::warn!("could not remove {} after copy: {}", local.display(), e);
            }
        }

        let dest = tokio::fs::canonicalize(&dest)
            .await
            .map_err(|e| io_error("resolve", &dest, e))?;
        let url = url::Url::from_file_path(&dest)
            .map_err(|()| FetchError::Permanent(format!("not an absolute path: {}", dest.display())))?;
        tracing::debug!(key, url = %url, "stored file");
        Ok(url.to_string())
    }
}
