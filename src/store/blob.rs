use crate::error::{Result, TaskError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Folder uploaded task images live under
pub const TASK_IMAGE_PREFIX: &str = "tasks";

/// Blob storage for task images
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload a local file and return a durable URL for it
    async fn upload(&self, local: &Path) -> Result<String>;
}

/// Blob storage backed by a local directory, handing out `file://` URLs
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where an upload of `local` ends up
    pub fn destination(&self, local: &Path) -> Result<PathBuf> {
        let file_name = local
            .file_name()
            .ok_or_else(|| TaskError::Validation(format!("not a file: {}", local.display())))?;
        Ok(self.root.join(TASK_IMAGE_PREFIX).join(file_name))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, local: &Path) -> Result<String> {
        let destination = self.destination(local)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &destination)
            .await
            .map_err(|e| TaskError::Store(format!("upload of {} failed: {}", local.display(), e)))?;

        let absolute = tokio::fs::canonicalize(&destination).await?;
        debug!(from = %local.display(), to = %absolute.display(), "uploaded image");
        Ok(format!("file://{}", absolute.display()))
    }
}
